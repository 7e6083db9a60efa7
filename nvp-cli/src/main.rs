mod cli;

use std::sync::Arc;

use clap::Parser;

use cli::{Cli, Commands, SnapshotCommands};
use nvp::{Client, ClientConfig};
use nvp_server::{MemBackend, Server, ServerConfig};

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Serve { threads } => serve(&cli.uri, threads),
        command => {
            let config = ClientConfig {
                queue_depth: cli.queue_depth,
                ha_enabled: !cli.no_ha,
                ..Default::default()
            };
            let client = Client::connect(&cli.uri, &config)?;
            client_command(&client, command)
        }
    }
}

fn serve(uri: &str, threads: usize) -> Result<(), Box<dyn std::error::Error>> {
    let uri: nvp::transport::Uri = uri.parse()?;
    let backend = Arc::new(MemBackend::new(&uri.to_string()));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let server = rt.block_on(Server::bind(
        &uri,
        backend,
        ServerConfig {
            work_queue_threads: threads,
            ..Default::default()
        },
    ))?;
    let handle = server.handle();
    ctrlc::set_handler(move || {
        log::info!("interrupt received, shutting down");
        handle.shutdown();
    })?;
    println!("serving on {uri}");
    rt.block_on(server.run())?;
    Ok(())
}

fn client_command(client: &Client, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Serve { .. } => unreachable!("handled by caller"),
        Commands::Create { volume, size } => {
            client.create_volume(&volume, size)?;
            println!("created '{volume}' ({size} bytes)");
        }
        Commands::Remove { volume } => {
            client.remove_volume(&volume)?;
            println!("removed '{volume}'");
        }
        Commands::Truncate { volume, size } => {
            client.truncate_volume(&volume, size)?;
            println!("truncated '{volume}' to {size} bytes");
        }
        Commands::Stat { volume } => {
            println!("{}", client.stat_volume(&volume)?);
        }
        Commands::List => {
            for name in client.list_volumes()? {
                println!("{name}");
            }
        }
        Commands::Snapshot { command } => snapshot_command(client, command)?,
        Commands::Read {
            volume,
            offset,
            size,
        } => {
            client.open_volume(&volume)?;
            let buf = client.allocate_buffer(size)?;
            let read = client.aio_read(buf, offset)?;
            let n = read.wait()?;
            let buf = read.take_buffer().ok_or("read returned no buffer")?;
            for chunk in buf.as_slice()[..n as usize].chunks(16) {
                for byte in chunk {
                    print!("{byte:02x} ");
                }
                println!();
            }
            client.close_volume()?;
        }
        Commands::Write {
            volume,
            offset,
            size,
            fill,
        } => {
            client.open_volume(&volume)?;
            let data = vec![fill; size];
            let n = client.aio_write(&data, offset)?.wait()?;
            println!("wrote {n} bytes at offset {offset}");
            client.close_volume()?;
        }
    }
    Ok(())
}

fn snapshot_command(
    client: &Client,
    command: SnapshotCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        SnapshotCommands::Create {
            volume,
            snapshot,
            timeout,
        } => {
            client.snapshot_create(&volume, &snapshot, timeout)?;
            println!("created snapshot '{snapshot}' of '{volume}'");
        }
        SnapshotCommands::Remove { volume, snapshot } => {
            client.snapshot_remove(&volume, &snapshot)?;
            println!("removed snapshot '{snapshot}' of '{volume}'");
        }
        SnapshotCommands::Rollback { volume, snapshot } => {
            client.snapshot_rollback(&volume, &snapshot)?;
            println!("rolled '{volume}' back to '{snapshot}'");
        }
        SnapshotCommands::List { volume } => {
            let (snapshots, size) = client.snapshot_list(&volume)?;
            println!("volume size: {size} bytes");
            for name in snapshots {
                println!("{name}");
            }
        }
        SnapshotCommands::Synced { volume, snapshot } => {
            println!("{}", client.is_snapshot_synced(&volume, &snapshot)?);
        }
    }
    Ok(())
}
