use super::{json_pretty, spin_fail, spin_ok, spinner, CommandResult, EXIT_SUCCESS};
use clap::Args;
use envd_core::{CoreError, EnvironmentEngine};
use envd_schema::{
    env_name_from_dir, resolve_gpu_request, BuildGraph, DockerSource, EngineSource, RunnerType,
    StartOptions, LOCALHOST,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Args)]
pub struct UpArgs {
    /// Build context directory of the environment.
    #[arg(short, long, default_value = ".")]
    pub path: PathBuf,
    /// Environment name; derived from the build context when omitted.
    #[arg(long)]
    pub name: Option<String>,
    /// Image to start the environment from.
    #[arg(long)]
    pub image: Option<String>,
    /// Compiled build graph (JSON) to use instead of the one recorded in the image.
    #[arg(long, value_name = "FILE")]
    pub graph: Option<PathBuf>,
    /// GPU device specification, e.g. `device=0,1` or `all`.
    #[arg(long, value_name = "SPEC")]
    pub gpus: Option<String>,
    /// Number of GPUs; -1 for all, 0 to disable.
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub gpu_num: Option<i64>,
    /// Start without GPUs even if the image asks for them.
    #[arg(long, default_value_t = false)]
    pub no_gpu: bool,
    #[arg(long)]
    pub cpus: Option<String>,
    #[arg(long)]
    pub cpu_set: Option<String>,
    #[arg(long)]
    pub memory: Option<String>,
    /// Shared memory in MiB.
    #[arg(long, default_value_t = 0)]
    pub shm_size: u32,
    /// Extra bind mount as `source:target`; repeatable.
    #[arg(short, long = "mount", value_name = "SOURCE:TARGET")]
    pub mounts: Vec<String>,
    /// Host port for SSH; 0 picks a free one.
    #[arg(long, default_value_t = 0)]
    pub ssh_port: u16,
    /// Host address the SSH port binds to.
    #[arg(long, default_value = LOCALHOST)]
    pub host: String,
    /// Seconds to wait for the environment to run.
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,
    /// Replace an environment that is still running.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

/// The graph the GPU decision is made from: the explicit one, else the one
/// recorded on the image. Images that only carry the GPU flag stand in as
/// asking for every device.
fn gpu_graph(
    engine: &dyn EnvironmentEngine,
    explicit: Option<&BuildGraph>,
    image: Option<&str>,
) -> Option<BuildGraph> {
    if let Some(g) = explicit {
        return Some(g.clone());
    }
    let image = image?;
    let recorded = engine
        .get_image_graph(image)
        .and_then(|graph| match graph {
            Some(g) => Ok(Some(g)),
            None => Ok(engine.get_image(image)?.manifest.gpu.then(|| BuildGraph {
                num_gpus: Some(-1),
                ..BuildGraph::default()
            })),
        });
    match recorded {
        Ok(graph) => graph,
        Err(e) => {
            tracing::debug!(image = %image, "no image graph for gpu detection: {e}");
            None
        }
    }
}

pub fn options_from_args(
    engine: &dyn EnvironmentEngine,
    args: &UpArgs,
) -> Result<StartOptions, CoreError> {
    let context = args.path.canonicalize()?;
    let name = match &args.name {
        Some(n) => n.clone(),
        None => env_name_from_dir(&context)?,
    };
    let graph = args.graph.as_ref().map(BuildGraph::from_file).transpose()?;

    let mut opts = StartOptions::new(&name, &context.to_string_lossy());
    opts.image.clone_from(&args.image);
    opts.gpu = resolve_gpu_request(
        args.gpus.as_deref(),
        args.gpu_num,
        gpu_graph(engine, graph.as_ref(), args.image.as_deref()).as_ref(),
        args.no_gpu,
    );
    opts.num_cpu.clone_from(&args.cpus);
    opts.cpu_set.clone_from(&args.cpu_set);
    opts.num_mem.clone_from(&args.memory);
    opts.shm_size = args.shm_size;
    opts.ssh_port = args.ssh_port;
    opts.sshd_host.clone_from(&args.host);
    opts.timeout = Duration::from_secs(args.timeout);
    opts.forced = args.force;
    opts.source = match engine.runner() {
        RunnerType::Docker => EngineSource::Docker(DockerSource {
            graph,
            mount_options: args.mounts.clone(),
        }),
        RunnerType::EnvdServer => EngineSource::Server,
    };
    Ok(opts)
}

pub fn run(engine: &dyn EnvironmentEngine, args: &UpArgs, json: bool) -> CommandResult {
    let opts = options_from_args(engine, args)?;
    let pb = (!json).then(|| spinner(&format!("starting {}...", opts.environment_name)));

    let result = match engine.start(&opts) {
        Ok(r) => r,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("{} failed to start", opts.environment_name));
            }
            return Err(e.into());
        }
    };

    if let Some(pb) = &pb {
        spin_ok(pb, &format!("{} is running", result.name));
    }
    if json {
        println!("{}", json_pretty(&result)?);
    } else {
        println!("ssh port: {}", result.ssh_port);
        if !result.address.is_empty() {
            println!("address:  {}", result.address);
        }
        for port in &result.ports {
            println!("{:<9} {}", format!("{}:", port.name), port.port);
        }
    }
    Ok(EXIT_SUCCESS)
}
