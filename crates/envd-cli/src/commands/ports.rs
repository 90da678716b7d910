use super::{json_pretty, print_port_table, CommandResult, EXIT_SUCCESS};
use envd_core::EnvironmentEngine;

pub fn run(engine: &dyn EnvironmentEngine, name: &str, json: bool) -> CommandResult {
    let bindings = engine.list_env_port_bindings(name)?;
    if json {
        println!("{}", json_pretty(&bindings)?);
    } else {
        print_port_table(&bindings);
    }
    Ok(EXIT_SUCCESS)
}
