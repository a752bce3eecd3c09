use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vemu::cli::{Cli, Command, ImageCommand, LimaCommand};
use vemu::config;
use vemu::context::Context;
use vemu::launch::{ExecExecutor, LaunchOutcome, ScriptExecutor};
use vemu::lima::{self, LimaBackend};
use vemu::logging;
use vemu::paths;
use vemu::vm::Vm;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vemu=info"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures vemu=debug, initially discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vemu=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    // Lima verbs don't need a vemu.toml
    if let Command::Lima { action } = cli.command {
        return run_lima(action).await;
    }

    let root_env = std::env::var("VEMU_ROOT").ok();
    let root = paths::resolve_root(cli.root.as_deref(), root_env.as_deref());
    let context = Context::new(root);
    let sys_config = config::load_config(&cli.config)?;

    if let Command::Image {
        action: ImageCommand::Pull,
    } = cli.command
    {
        let path = vemu::image::pull_base_image(&context, &sys_config.image, &sys_config.arch).await?;
        println!("{}", path.display());
        return Ok(());
    }

    let mut vm = Vm::new(
        sys_config.to_vm_config()?,
        context,
        Some(sys_config.cloud_config()),
    )?;

    // Activate file logging now that the VM directory exists
    if let Err(e) = file_handle.set_file(&vm.paths().log_file()) {
        tracing::warn!(error = %e, "file logging disabled");
    }

    match cli.command {
        Command::Lima { .. } | Command::Image { .. } => unreachable!(),
        Command::Prepare => {
            vm.prepare().await?;
            println!("VM '{}' prepared in {}", vm.name(), vm.paths().dir().display());
        }
        Command::Start => {
            // Only returns if exec failed
            vm.launch(&ExecExecutor).await?;
        }
        Command::Script { output } => {
            let path = output.unwrap_or_else(|| vm.paths().run_script());
            let LaunchOutcome::ScriptWritten { path } = vm.launch(&ScriptExecutor::new(path)).await?;
            println!("{}", path.display());
        }
        Command::Args => {
            for arg in vm.build_hypervisor_arguments() {
                println!("{arg}");
            }
        }
        Command::Reset => {
            vm.reset().await?;
            println!("VM '{}' reset", vm.name());
        }
        Command::Status => {
            let state = vm.state()?;
            println!("VM '{}': {state}", vm.name());
            if let Some(sock) = vm.guest_agent_socket() {
                println!("  Guest agent: {}", sock.display());
            }
        }
    }

    Ok(())
}

fn lima_backend(template: Option<String>) -> LimaBackend {
    match template {
        Some(template) => LimaBackend::default().with_template(template),
        None => LimaBackend::default(),
    }
}

async fn run_lima(action: LimaCommand) -> miette::Result<()> {
    let (outcome, started) = match action {
        LimaCommand::Create { name, mut opts } => {
            let lima = lima_backend(opts.template.take());
            (lima.create(&name, &opts.into()).await?, None)
        }
        LimaCommand::Start { name, mut opts } => {
            let lima = lima_backend(opts.template.take());
            (lima.start(&name, &opts.into()).await?, Some(name))
        }
        LimaCommand::Stop { name, force } => (LimaBackend::default().stop(&name, force).await?, None),
        LimaCommand::Rm { name, force } => (LimaBackend::default().rm(&name, force).await?, None),
    };

    for line in &outcome.lines {
        println!("{line}");
    }
    if !outcome.success {
        std::process::exit(outcome.exit_code);
    }
    if let Some(path) = started.as_deref().and_then(lima::ssh_config_path) {
        println!("SSH config: {}", path.display());
    }
    Ok(())
}
