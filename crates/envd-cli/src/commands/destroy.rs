use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use envd_core::EnvironmentEngine;

pub fn run(engine: &dyn EnvironmentEngine, name: &str, json: bool) -> CommandResult {
    let removed = engine.destroy(name)?;
    if json {
        println!(
            "{}",
            json_pretty(&serde_json::json!({ "name": name, "removed": removed.is_some() }))?
        );
    } else if removed.is_some() {
        println!("destroyed environment '{name}'");
    } else {
        println!("environment '{name}' does not exist, nothing to destroy");
    }
    Ok(EXIT_SUCCESS)
}
