use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::managers::{resources::ResourceSpec, virtual_machine::Backend};
use crate::storage::config_store::HostDirectoryFunction;

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Cli {
    /// Directory holding the configuration database and default storage
    #[arg(short = 'H', long)]
    pub home_dir: PathBuf,
    #[arg(long)]
    pub qemu_path: Option<PathBuf>,
    #[arg(long)]
    pub qemu_img_path: Option<PathBuf>,
    #[arg(long)]
    pub wsl_path: Option<PathBuf>,
    /// Root file system imported as the base of every WSL disk
    #[arg(long)]
    pub wsl_helper_image: Option<PathBuf>,
    #[arg(long, default_value = "nvidia-smi")]
    pub nvidia_smi_path: PathBuf,
    #[arg(short = 't', long, default_value_t = 120)]
    pub endpoint_wait_time_secs: u64,
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,
    #[arg(long, default_value_t = 30)]
    pub connect_timeout_secs: u64,
    /// Answer yes to every confirmation
    #[arg(short = 'y', long)]
    pub assume_yes: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Shows the minimum, recommended and maximum machine this host can run
    Plan {
        #[arg(short, long)]
        gpu_model: Option<String>,
    },

    Create {
        name: String,

        #[arg(short, long, value_enum, default_value_t = BackendArg::Qemu)]
        backend: BackendArg,

        /// Image that becomes the OS disk, `.gz` images are unpacked
        #[arg(short, long)]
        image_url: String,

        /// Additional artifact to stage, may be repeated
        #[arg(short, long)]
        artifact: Vec<String>,

        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// Runs the machine in the foreground until it exits or Ctrl-C is pressed
    Start {
        name: String,

        /// Processors for this run only
        #[arg(short, long)]
        processors: Option<u32>,

        /// Memory for this run only
        #[arg(short, long)]
        memory_gb: Option<u32>,
    },

    Stop {
        name: String,
    },

    Kill {
        name: String,
    },

    /// Grows disks of a stopped machine, disks never shrink
    Resize {
        name: String,
        #[arg(long)]
        os_disk_gb: Option<u32>,
        #[arg(long)]
        cluster_disk_gb: Option<u32>,
        #[arg(long)]
        data_disk_gb: Option<u32>,
    },

    Delete {
        name: String,
    },

    List,

    Inspect {
        name: String,
    },

    History {
        name: String,
    },

    /// Lists the host directories bound to every storage function
    Dirs,

    MoveStorage {
        #[arg(value_enum)]
        function: DirectoryArg,
        path: PathBuf,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceArgs {
    #[arg(long)]
    pub processors: Option<u32>,
    #[arg(long)]
    pub memory_gb: Option<u32>,
    #[arg(long)]
    pub gpu_model: Option<String>,
    #[arg(long)]
    pub gpu_count: Option<u32>,
    #[arg(long)]
    pub os_disk_gb: Option<u32>,
    #[arg(long)]
    pub cluster_disk_gb: Option<u32>,
    #[arg(long)]
    pub data_disk_gb: Option<u32>,
    #[arg(long)]
    pub ssh_port: Option<u16>,
    #[arg(long)]
    pub kubernetes_port: Option<u16>,
    #[arg(long)]
    pub http_port: Option<u16>,
    #[arg(long)]
    pub https_port: Option<u16>,
}

impl ResourceArgs {
    /// Overrides the fields of `base` that were given on the command line.
    pub fn apply_to(&self, mut base: ResourceSpec) -> ResourceSpec {
        if let Some(processors) = self.processors {
            base.processors = processors;
        }
        if let Some(memory_gb) = self.memory_gb {
            base.memory_gb = memory_gb;
        }
        if let Some(gpu_model) = &self.gpu_model {
            base.gpu_model = Some(gpu_model.clone());
        }
        if let Some(gpu_count) = self.gpu_count {
            base.gpu_count = gpu_count;
            if gpu_count == 0 {
                base.gpu_model = None;
                base.gpu_memory_gb = 0;
            }
        }
        if let Some(os_disk_gb) = self.os_disk_gb {
            base.os_disk_gb = os_disk_gb;
        }
        if let Some(cluster_disk_gb) = self.cluster_disk_gb {
            base.cluster_disk_gb = cluster_disk_gb;
        }
        if let Some(data_disk_gb) = self.data_disk_gb {
            base.data_disk_gb = data_disk_gb;
        }
        if let Some(ssh_port) = self.ssh_port {
            base.ports.ssh_port = ssh_port;
        }
        if let Some(kubernetes_port) = self.kubernetes_port {
            base.ports.kubernetes_port = kubernetes_port;
        }
        if let Some(http_port) = self.http_port {
            base.ports.http_port = http_port;
        }
        if let Some(https_port) = self.https_port {
            base.ports.https_port = https_port;
        }
        base
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    Qemu,
    Wsl,
    Cloud,
}

impl From<BackendArg> for Backend {
    fn from(backend: BackendArg) -> Self {
        match backend {
            BackendArg::Qemu => Backend::LocalHypervisor,
            BackendArg::Wsl => Backend::NativeLightweightVm,
            BackendArg::Cloud => Backend::Cloud,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryArg {
    DownloadCache,
    VmOs,
    VmCluster,
    VmData,
    Backup,
}

impl From<DirectoryArg> for HostDirectoryFunction {
    fn from(directory: DirectoryArg) -> Self {
        match directory {
            DirectoryArg::DownloadCache => HostDirectoryFunction::DownloadCache,
            DirectoryArg::VmOs => HostDirectoryFunction::VmOs,
            DirectoryArg::VmCluster => HostDirectoryFunction::VmCluster,
            DirectoryArg::VmData => HostDirectoryFunction::VmData,
            DirectoryArg::Backup => HostDirectoryFunction::Backup,
        }
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::{BackendArg, Cli, Command, DirectoryArg, ResourceArgs};
    use crate::utils::test_utilities::create_example_spec;

    #[test]
    fn parse_create() {
        let cli = Cli::try_parse_from([
            "sandbox",
            "-H",
            "/tmp/sandbox",
            "create",
            "lab",
            "--backend",
            "wsl",
            "--image-url",
            "https://example.com/rootfs.tar.gz",
            "--artifact",
            "https://example.com/k3s",
            "--memory-gb",
            "12",
        ])
        .unwrap();
        match cli.command {
            Command::Create {
                name,
                backend,
                artifact,
                resources,
                ..
            } => {
                assert_eq!(name, "lab");
                assert_eq!(backend, BackendArg::Wsl);
                assert_eq!(artifact.len(), 1);
                assert_eq!(resources.memory_gb, Some(12));
                assert_eq!(resources.processors, None);
            }
            command => panic!("Unexpected command {:?}", command),
        }
    }

    #[test]
    fn parse_move_storage() {
        let cli =
            Cli::try_parse_from(["sandbox", "-H", "/h", "move-storage", "vm-data", "/mnt/big"])
                .unwrap();
        assert_eq!(
            cli.command,
            Command::MoveStorage {
                function: DirectoryArg::VmData,
                path: "/mnt/big".into()
            }
        );
    }

    #[test]
    fn home_dir_is_required() {
        assert!(Cli::try_parse_from(["sandbox", "list"]).is_err());
    }

    #[test]
    fn resource_args_override_base() {
        let args = ResourceArgs {
            processors: Some(6),
            data_disk_gb: Some(80),
            https_port: Some(9443),
            ..Default::default()
        };
        let spec = args.apply_to(create_example_spec());
        assert_eq!(spec.processors, 6);
        assert_eq!(spec.memory_gb, create_example_spec().memory_gb);
        assert_eq!(spec.data_disk_gb, 80);
        assert_eq!(spec.ports.https_port, 9443);
    }

    #[test]
    fn zero_gpus_clear_model() {
        let mut base = create_example_spec();
        base.gpu_model = Some(String::from("Tesla T4"));
        base.gpu_count = 1;
        let args = ResourceArgs {
            gpu_count: Some(0),
            ..Default::default()
        };
        assert_eq!(args.apply_to(base).gpu_model, None);
    }
}
