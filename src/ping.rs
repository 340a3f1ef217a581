//! Ping service
//!
//! The server echoes every message back to its sender and stops on a
//! zero-length message. The client finds the server through the name
//! service, measures round trips, then sends that zero-length message.

use multicore_ipc_core::{IpcError, Result};
use multicore_ipc_rpmsg::{Endpoint, MessageTransport, ServiceAddress, ADDR_ANY};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Name the server announces itself under
pub const PING_SERVICE: &str = "rpmsg-ping";

/// Create the server endpoint, announce it and run it on its own task.
///
/// The task resolves to the number of messages echoed.
pub async fn serve(transport: &MessageTransport, addr: u32) -> Result<JoinHandle<Result<u64>>> {
    let endpoint = transport.create_endpoint(addr)?;
    let addr = endpoint.addr();
    transport.register_service(PING_SERVICE, addr).await?;
    info!("Ping service listening at {} on {}", addr, transport.local_id());

    let transport = transport.clone();
    Ok(tokio::spawn(async move {
        let served = echo_loop(endpoint).await?;
        transport.unregister_service(PING_SERVICE, addr).await?;
        Ok(served)
    }))
}

async fn echo_loop(mut endpoint: Endpoint) -> Result<u64> {
    let mut served = 0;
    while let Some(msg) = endpoint.recv().await {
        endpoint.reply(&msg, &msg.payload).await?;
        served += 1;
    }
    debug!("Ping endpoint {} received teardown", endpoint.addr());
    Ok(served)
}

#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub service: ServiceAddress,
    pub rounds: u32,
    pub payload_bytes: usize,
    pub min_rtt_us: u64,
    pub avg_rtt_us: u64,
    pub max_rtt_us: u64,
}

/// Discover the ping service and run `rounds` echo exchanges
pub async fn run_client(
    transport: &MessageTransport,
    rounds: u32,
    payload_bytes: usize,
    timeout: Duration,
) -> Result<PingReport> {
    let service = transport
        .wait_for_service(PING_SERVICE, timeout)
        .await
        .ok_or_else(|| IpcError::Timeout(format!("service '{}' never announced", PING_SERVICE)))?;
    let mut endpoint = transport.create_endpoint(ADDR_ANY)?;

    let mut rtts = Vec::with_capacity(rounds as usize);
    for round in 0..rounds {
        let payload: Vec<u8> = (0..payload_bytes)
            .map(|i| (round as usize + i) as u8)
            .collect();

        let started = Instant::now();
        endpoint.send(service.proc, service.addr, &payload).await?;
        let echo = endpoint
            .recv_timeout(timeout)
            .await?
            .ok_or_else(|| IpcError::Malformed("ping endpoint closed".to_string()))?;
        rtts.push(started.elapsed().as_micros() as u64);

        if echo.payload.as_ref() != payload.as_slice() {
            return Err(IpcError::Malformed(format!(
                "round {} echoed {} bytes that differ from the {} sent",
                round,
                echo.payload.len(),
                payload.len()
            )));
        }
    }

    // Zero-length message stops the server
    endpoint.send(service.proc, service.addr, &[]).await?;

    let total: u64 = rtts.iter().sum();
    Ok(PingReport {
        service,
        rounds,
        payload_bytes,
        min_rtt_us: rtts.iter().copied().min().unwrap_or(0),
        avg_rtt_us: if rtts.is_empty() { 0 } else { total / rtts.len() as u64 },
        max_rtt_us: rtts.iter().copied().max().unwrap_or(0),
    })
}
