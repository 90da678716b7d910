use super::{colorize_status, json_pretty, or_dash, print_port_table, CommandResult, EXIT_SUCCESS};
use envd_core::EnvironmentEngine;

pub fn run(engine: &dyn EnvironmentEngine, name: &str, json: bool) -> CommandResult {
    let env = engine.get_environment(name)?;
    let ports = engine.list_env_port_bindings(name)?;
    let dependency = engine.list_env_dependency(name)?;

    if json {
        let doc = serde_json::json!({
            "environment": env,
            "ports": ports,
            "dependency": dependency,
        });
        println!("{}", json_pretty(&doc)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("name:     {}", env.name);
    println!("status:   {}", colorize_status(&env.status.to_string()));
    println!("image:    {}", env.image);
    println!("ssh:      {}", env.ssh_port);
    println!("gpu:      {}", env.manifest.gpu);
    println!("cuda:     {}", or_dash(env.manifest.cuda.as_deref()));
    println!("jupyter:  {}", or_dash(env.jupyter_addr.as_deref()));
    println!("rstudio:  {}", or_dash(env.rstudio_addr.as_deref()));
    println!();
    print_port_table(&ports);
    if !dependency.is_empty() {
        println!();
        super::deps::print_dependency(&dependency);
    }
    Ok(EXIT_SUCCESS)
}
