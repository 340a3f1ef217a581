//! Every configured processor inside one OS process
//!
//! Each processor gets its own [`MessageTransport`]; all of them share one
//! mailbox hub for notifications and one region pool for ring memory.

use crate::IpcConfig;
use multicore_ipc_core::{EventSink, MailboxHub, MultiProc, ProcId, Result, TracingEventSink};
use multicore_ipc_rpmsg::MessageTransport;
use multicore_ipc_shared_memory::RegionPool;
use std::sync::Arc;
use tracing::info;

pub struct LocalCluster {
    hub: Arc<MailboxHub>,
    pool: Arc<RegionPool>,
    transports: Vec<(String, MessageTransport)>,
}

impl LocalCluster {
    pub fn new(config: &IpcConfig) -> Result<Self> {
        Self::with_event_sink(config, Arc::new(TracingEventSink))
    }

    pub fn with_event_sink(config: &IpcConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let hub = MailboxHub::new();
        let pool = RegionPool::new();

        let mut transports = Vec::new();
        for name in &config.multiproc.processors {
            let mut table = config.multiproc.clone();
            table.local = Some(name.clone());
            let multiproc = MultiProc::new(&table)?;
            let local = multiproc.self_id()?;

            let transport = MessageTransport::builder()
                .multiproc(multiproc)
                .notifier(Arc::new(hub.notifier(local)))
                .regions(pool.clone())
                .config(config.transport.clone())
                .event_sink(Arc::clone(&events))
                .build()?;
            transports.push((name.clone(), transport));
        }

        Ok(Self {
            hub,
            pool,
            transports,
        })
    }

    /// Attach every processor to every other one
    pub async fn attach_all(&self) -> Result<()> {
        for (name, transport) in &self.transports {
            for (_, peer) in &self.transports {
                let remote = peer.local_id();
                if remote != transport.local_id() {
                    transport.attach(remote).await?;
                }
            }
            info!("{} attached to {} peers", name, self.transports.len() - 1);
        }
        Ok(())
    }

    pub fn transport(&self, name: &str) -> Option<&MessageTransport> {
        self.transports
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, transport)| transport)
    }

    pub fn transport_for(&self, id: ProcId) -> Option<&MessageTransport> {
        self.transports.get(id.index()).map(|(_, transport)| transport)
    }

    pub fn processors(&self) -> impl Iterator<Item = &str> {
        self.transports.iter().map(|(name, _)| name.as_str())
    }

    pub fn hub(&self) -> &Arc<MailboxHub> {
        &self.hub
    }

    /// Shared regions handed out so far, one per attached pair
    pub fn region_count(&self) -> usize {
        self.pool.len()
    }

    /// Detach everything; the first failure is returned
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for (_, transport) in &self.transports {
            if let Err(e) = transport.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicore_ipc_rpmsg::{ConnectionState, ADDR_ANY};
    use std::time::Duration;

    #[tokio::test]
    async fn test_three_processor_cluster() {
        let config = IpcConfig::default();
        let cluster = LocalCluster::new(&config).unwrap();
        cluster.attach_all().await.unwrap();
        assert_eq!(cluster.region_count(), 3);
        assert_eq!(cluster.processors().collect::<Vec<_>>(), ["HOST", "DSP", "IPU"]);

        let dsp = cluster.transport("DSP").unwrap();
        let ipu = cluster.transport("IPU").unwrap();
        assert_eq!(
            ipu.connection_state(dsp.local_id()).unwrap(),
            ConnectionState::Attached
        );

        let mut inbox = dsp.create_endpoint(ADDR_ANY).unwrap();
        ipu.send(dsp.local_id(), 1024, inbox.addr(), b"frame ready")
            .await
            .unwrap();
        let msg = inbox
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.from, ipu.local_id());
        assert_eq!(msg.payload.as_ref(), b"frame ready");

        cluster.shutdown().await.unwrap();
        assert_eq!(
            ipu.connection_state(dsp.local_id()).unwrap(),
            ConnectionState::Detached
        );
        assert!(cluster.transport("GPU").is_none());
        assert!(cluster.transport_for(ProcId(2)).is_some());
    }
}
