//! Boots every configured processor in this process, runs a ping exchange
//! over the name service and prints what happened.
//!
//! Usage: `multicore-ipc [config.json]`

use anyhow::{Context, Result};
use multicore_ipc::{init_logger, ping, IpcConfig, LocalCluster};
use multicore_ipc_core::ADDR_ANY;
use multicore_ipc_shared_memory::{ResourceEntry, ResourceTable, RingGeometry};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Device address the rings are declared at in the resource table
const RING_DA: u32 = 0xA000_0000;
const TRACE_DA: u32 = 0x9F00_0000;
const TRACE_LEN: u32 = 0x8000;

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = IpcConfig::load(path.as_deref())?;
    init_logger(&config.log_level)?;

    let cluster = LocalCluster::new(&config).context("failed to build cluster")?;
    cluster.attach_all().await.context("failed to attach processors")?;
    info!(
        "Cluster up: {} processors, {} shared regions",
        config.multiproc.processors.len(),
        cluster.region_count()
    );

    let host_name = config
        .transport
        .name_service_host
        .clone()
        .context("ping demo needs a name_service_host")?;
    let server_name = cluster
        .processors()
        .find(|name| *name != host_name)
        .map(str::to_string)
        .context("ping demo needs at least two processors")?;
    let host = cluster
        .transport(&host_name)
        .context("name service host has no transport")?;
    let server = cluster
        .transport(&server_name)
        .context("server processor has no transport")?;

    let server_task = ping::serve(server, ADDR_ANY).await?;
    let payload = config.transport.max_message_size.min(64);
    let report = ping::run_client(host, 16, payload, Duration::from_secs(2)).await?;
    let served = server_task.await.context("ping server task failed")??;

    println!("Ping {} -> {} ({} echoes served)", host_name, server_name, served);
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!(
        "Host metrics: {}",
        serde_json::to_string(&host.metrics())?
    );

    let geometry = RingGeometry::new(config.transport.slot_count, config.transport.slot_size())
        .context("invalid ring geometry")?;
    let table = ResourceTable::for_ring_pair(RING_DA, geometry, TRACE_DA, TRACE_LEN)
        .context("rings do not fit the declared device address")?;
    let encoded = table.encode().context("failed to encode resource table")?;
    println!("Resource table: {} entries, {} bytes", table.entries().len(), encoded.len());
    for entry in table.entries() {
        match entry {
            ResourceEntry::Carveout(mem) | ResourceEntry::DevMem(mem) => {
                println!("  {:<10} da={:#010x} len={:#x}", mem.name, mem.da, mem.len)
            }
            ResourceEntry::Trace(trace) => {
                println!("  {:<10} da={:#010x} len={:#x}", trace.name, trace.da, trace.len)
            }
            ResourceEntry::Vdev(vdev) => {
                for (idx, vring) in vdev.vrings.iter().enumerate() {
                    println!(
                        "  vring{:<5} da={:#010x} num={} align={}",
                        idx, vring.da, vring.num, vring.align
                    );
                }
            }
        }
    }

    cluster.shutdown().await.context("shutdown failed")?;
    Ok(())
}
