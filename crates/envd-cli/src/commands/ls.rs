use super::{colorize_status, json_pretty, or_dash, CommandResult, EXIT_SUCCESS};
use envd_core::EnvironmentEngine;

pub fn run(engine: &dyn EnvironmentEngine, json: bool) -> CommandResult {
    let envs = engine.list_environments()?;
    if json {
        println!("{}", json_pretty(&envs)?);
    } else if envs.is_empty() {
        println!("no environments found");
    } else {
        println!(
            "{:<20} {:<10} {:<28} {:<6} {:<24} RSTUDIO",
            "NAME", "STATUS", "IMAGE", "SSH", "JUPYTER"
        );
        for env in &envs {
            println!(
                "{:<20} {:<10} {:<28} {:<6} {:<24} {}",
                env.name,
                colorize_status(&env.status.to_string()),
                env.image,
                env.ssh_port,
                or_dash(env.jupyter_addr.as_deref()),
                or_dash(env.rstudio_addr.as_deref()),
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
