use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vemu", about = "Provision QEMU VMs from cloud images with cloud-init seed disks")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vemu.toml")]
    pub config: PathBuf,

    /// State root holding VM directories and base images (default: $VEMU_ROOT or ~/.vemu)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the seed disk and differential disk if missing
    Prepare,

    /// Prepare, then replace this process with the hypervisor
    Start,

    /// Prepare, then write the hypervisor invocation to a bash script
    Script {
        /// Script path (default: <vm dir>/run.sh)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the hypervisor arguments, one per line
    Args,

    /// Delete the seed disk and differential disk
    Reset,

    /// Show the lifecycle state of the VM
    Status,

    /// Manage base images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },

    /// Drive a Lima instance instead of QEMU directly
    Lima {
        #[command(subcommand)]
        action: LimaCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// Download and verify the configured base image
    Pull,
}

#[derive(Subcommand, Debug)]
pub enum LimaCommand {
    /// Create an instance without starting it
    Create {
        name: String,
        #[command(flatten)]
        opts: LimaArgs,
    },
    /// Create (if needed) and start an instance
    Start {
        name: String,
        #[command(flatten)]
        opts: LimaArgs,
    },
    /// Stop an instance
    Stop {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Delete an instance
    Rm {
        name: String,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct LimaArgs {
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory in GiB
    #[arg(long)]
    pub memory: Option<u32>,

    #[arg(long)]
    pub arch: Option<String>,

    /// Disk size in GiB
    #[arg(long)]
    pub disk: Option<u32>,

    /// Lima VM type (vz, qemu)
    #[arg(long)]
    pub vm_type: Option<String>,

    /// Lima template locator (default: template://_images/ubuntu-24.04)
    #[arg(long)]
    pub template: Option<String>,
}

impl From<LimaArgs> for crate::lima::LimaOptions {
    fn from(args: LimaArgs) -> Self {
        Self {
            cpus: args.cpus,
            memory: args.memory,
            arch: args.arch,
            disk: args.disk,
            vm_type: args.vm_type,
        }
    }
}
