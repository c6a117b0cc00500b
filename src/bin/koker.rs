//! koker — minimal container runtime CLI.
//!
//! ```sh
//! koker container run [--hostname H] [--mem MB] [--swap MB] [--cpus F] [--pids N] IMAGE [CMD…]
//! koker container ls
//! koker container exec ID CMD…
//! koker image pull IMAGE
//! koker image ls
//! koker image rm IMAGE
//! ```
//!
//! The hidden `container child` subcommand is the re-exec target of
//! `run` and never appears in help output. Root privileges are required
//! for every subcommand.

use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use koker::container::{self, Container, RunOptions};
use koker::image::{self, normalize_reference};
use koker::repository::ImageRepository;
use koker::{network, utils, Error, Result};

#[derive(Parser, Debug)]
#[command(name = "koker", version, about = "Minimal container runtime")]
struct Cli {
    /// Disable all log output.
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    /// Log every executed step.
    #[arg(short = 'D', long = "debug", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage containers.
    #[command(subcommand, visible_alias = "c")]
    Container(ContainerCommand),
    /// Manage images.
    #[command(subcommand, visible_alias = "i")]
    Image(ImageCommand),
}

#[derive(Subcommand, Debug)]
enum ContainerCommand {
    /// Run a command in a new container.
    Run(RunArgs),
    /// Internal re-exec target of `run`.
    #[command(hide = true)]
    Child(ChildArgs),
    /// List running containers.
    Ls,
    /// Run an additional command in a running container.
    Exec(ExecArgs),
}

#[derive(Subcommand, Debug)]
enum ImageCommand {
    /// Pull an image from a registry.
    Pull {
        /// Image reference, `name[:tag]`.
        image: String,
    },
    /// List all available images.
    Ls,
    /// Remove an image from the local index.
    Rm {
        /// Image reference, `name[:tag]`.
        image: String,
    },
}

#[derive(Args, Debug)]
struct LimitArgs {
    /// Container hostname.
    #[arg(long, default_value = "")]
    hostname: String,

    /// Memory limit in MiB.
    #[arg(long = "mem", default_value_t = -1)]
    memory: i64,

    /// Additional swap limit in MiB.
    #[arg(long, default_value_t = -1)]
    swap: i64,

    /// Maximum number of processes.
    #[arg(long, default_value_t = -1)]
    pids: i64,

    /// Number of CPU cores to restrict to.
    #[arg(long, default_value_t = -1.0)]
    cpus: f64,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    limits: LimitArgs,

    /// Image reference, `name[:tag]`.
    image: String,

    /// Command and arguments; the image `Cmd` when omitted.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cmd: Vec<String>,
}

#[derive(Args, Debug)]
struct ChildArgs {
    #[command(flatten)]
    limits: LimitArgs,

    /// Container id created by the parent.
    id: String,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cmd: Vec<String>,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Container id.
    id: String,

    /// Command and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    cmd: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.debug);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Log level is info unless `-D` raises it to debug; `-q` wins over
/// both. Logs go to stderr so container output owns stdout.
fn init_tracing(quiet: bool, debug: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::Privilege);
    }
    utils::init_dirs()?;

    let mut repo = ImageRepository::load()?;
    let opts_of = |l: &LimitArgs| RunOptions {
        hostname: l.hostname.clone(),
        memory_mb: l.memory,
        swap_mb: l.swap,
        pids: l.pids,
        cpus: l.cpus,
        quiet: cli.quiet,
        debug: cli.debug,
    };

    match &cli.command {
        Command::Container(ContainerCommand::Run(args)) => {
            // The bridge and NAT rule must exist before any container
            // state is created.
            network::preflight()?;

            let id = utils::gen_container_id();
            let mut container = Container::new(&id)?;
            let code = container.run(&mut repo, &args.image, &args.cmd, &opts_of(&args.limits))?;
            repo.save()?;
            Ok(code)
        }
        Command::Container(ContainerCommand::Child(args)) => {
            let mut container = Container::new(&args.id)?;
            container.load_config()?;
            container.run_child(&args.cmd, &opts_of(&args.limits))
        }
        Command::Container(ContainerCommand::Ls) => {
            println!("{:<16}{:<16}COMMAND", "CONTAINER ID", "IMAGE");
            for c in container::list_all()? {
                println!(
                    "{:<16}{:<16}{}",
                    truncate(&c.id, 12),
                    truncate(&c.image, 12),
                    c.command
                );
            }
            Ok(0)
        }
        Command::Container(ContainerCommand::Exec(args)) => {
            let mut container = Container::new(&args.id)?;
            container.load_config()?;
            container.exec(&args.cmd)
        }
        Command::Image(ImageCommand::Pull { image }) => {
            image::resolve(&mut repo, image)?;
            repo.save()?;
            Ok(0)
        }
        Command::Image(ImageCommand::Ls) => {
            println!("{:<40}{:<16}IMAGE ID", "REPOSITORY", "TAG");
            for img in repo.list() {
                println!(
                    "{:<40}{:<16}{}",
                    img.repository,
                    img.tag,
                    truncate(&img.id, 12)
                );
            }
            Ok(0)
        }
        Command::Image(ImageCommand::Rm { image }) => {
            let name = normalize_reference(image);
            if repo.remove(&name).is_some() {
                repo.save()?;
                Ok(0)
            } else {
                error!(image = %name, "no such image");
                Ok(1)
            }
        }
    }
}

fn truncate(s: &str, n: usize) -> &str {
    &s[..n.min(s.len())]
}
