use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use envd_core::EnvironmentEngine;

pub fn run(engine: &dyn EnvironmentEngine, name: &str, json: bool) -> CommandResult {
    let changed = engine.pause(name)?;
    if json {
        println!(
            "{}",
            json_pretty(&serde_json::json!({ "name": name, "changed": changed.is_some() }))?
        );
    } else if changed.is_some() {
        println!("paused '{name}'");
    } else {
        println!("'{name}' is already paused");
    }
    Ok(EXIT_SUCCESS)
}
