use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fm::FabricManager;
use fm_device::MemDevice;

/// Fabric manager: resolves RPC services, allocates replicated
/// shared-memory channels between clients and servers, and relays their
/// read/write traffic to the backing devices.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Unix socket path clients and servers connect to.
    client_socket_path: PathBuf,
    /// Unix socket path the admin (failure-injection) tool connects to.
    admin_socket_path: PathBuf,
    /// Size in MiB of each replica backing file.
    replica_size_mib: u64,
    /// Backing file paths, one per replica (exactly `NUM_REPLICAS`).
    #[arg(required = true, num_args = 1..)]
    replica_path: Vec<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if args.replica_path.len() != fm_proto::NUM_REPLICAS {
        eprintln!(
            "expected exactly {} replica paths, got {}",
            fm_proto::NUM_REPLICAS,
            args.replica_path.len()
        );
        return ExitCode::FAILURE;
    }

    let replica_size = args.replica_size_mib * 1024 * 1024;
    let mut devices = Vec::with_capacity(args.replica_path.len());
    for path in &args.replica_path {
        match MemDevice::new(path, replica_size) {
            Ok(device) => devices.push(device),
            Err(e) => {
                eprintln!("failed to open backing device {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        }
    }

    let mut manager = match FabricManager::new(
        &args.client_socket_path,
        &args.admin_socket_path,
        devices,
        fm_proto::REPLICA_REGION_SIZE,
    ) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("failed to start fabric manager: {e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!(
        "listening: client={} admin={}",
        args.client_socket_path.display(),
        args.admin_socket_path.display()
    );

    if let Err(e) = manager.run() {
        eprintln!("fabric manager exited: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
