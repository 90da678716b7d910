use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use envd_core::EnvironmentEngine;
use envd_schema::Dependency;

pub fn print_dependency(dep: &Dependency) {
    for (kind, list) in [
        ("apt", &dep.apt_packages),
        ("pypi", &dep.pypi_packages),
        ("r", &dep.r_packages),
    ] {
        for package in list {
            println!("{kind:<6} {package}");
        }
    }
}

/// Packages of an environment, or of an image with `image`.
pub fn run(engine: &dyn EnvironmentEngine, name: &str, image: bool, json: bool) -> CommandResult {
    let dep = if image {
        engine.list_image_dependency(name)?
    } else {
        engine.list_env_dependency(name)?
    };
    if json {
        println!("{}", json_pretty(&dep)?);
    } else if dep.is_empty() {
        println!("no dependencies recorded for '{name}'");
    } else {
        println!("{:<6} PACKAGE", "KIND");
        print_dependency(&dep);
    }
    Ok(EXIT_SUCCESS)
}
