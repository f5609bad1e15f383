use std::{path::PathBuf, sync::Arc};

use clap::Parser;

use ospf_core::{
    config::DaemonConfig,
    logging::{self, LogFormat},
    server::{ControllerSettings, OspfServer},
    topology::{forwarding::LoggingForwarder, source::ChannelPacketIoProvider},
};

#[derive(Parser)]
#[command(name = "ospfd", about = "OSPFv2 link-state routing daemon")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "/etc/ospfd/config.json")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let config = DaemonConfig::load(&cli.config).inspect_err(|e| {
        tracing::error!(path = %cli.config.display(), error = %e, "failed to load config");
    })?;

    // No socket layer is wired in yet: interfaces run over in-memory queues.
    let packet_io = Arc::new(ChannelPacketIoProvider::new(config.channel_capacity));
    let mut injectors = Vec::with_capacity(config.interfaces.len());
    for intf in &config.interfaces {
        let mut wire = packet_io.attach(intf.key);
        injectors.push(wire.inject);
        let key = intf.key;
        tokio::spawn(async move {
            while let Some((destination, packet)) = wire.sent.recv().await {
                tracing::debug!(intf = %key, %destination, ?packet, "outbound packet");
            }
        });
    }

    let (handle, task) = OspfServer::spawn(
        ControllerSettings::from(&config),
        Arc::new(LoggingForwarder),
        packet_io.clone(),
    );

    for area in config.areas {
        handle.apply_area(area).await?;
    }
    for intf in config.interfaces {
        handle.apply_intf(intf).await?;
    }
    handle.apply_global(config.global).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("received SIGINT, shutting down");
    handle.shutdown().await?;
    task.await?;
    Ok(())
}
