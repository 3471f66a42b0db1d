mod common;

use std::time::Duration;

use anyhow::{anyhow, Result};
use common::{dev, fast_config, lamp};
use hbus::{
    core::{
        bus::EventKind,
        master::{Master, MasterState},
    },
    protocol::simulator::SimulatedBus,
    MasterHandle,
};

#[test]
fn test_handle_drives_a_simulated_bus() -> Result<()> {
    tokio_test::block_on(async {
        let bus = SimulatedBus::new(0);
        bus.add_slave(lamp(0xAB));
        let (handle, task) = MasterHandle::spawn(Master::new(fast_config(), bus.clone()));

        let events = handle.subscribe().await?;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Ok(event) = events.recv_async().await {
                if event.kind == EventKind::Operational {
                    return Ok(());
                }
            }
            Err(anyhow!("event stream closed"))
        })
        .await??;

        assert_eq!(handle.state().await?, MasterState::Operational);
        let devices = handle.devices().await?;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uid, 0xAB);

        assert_eq!(handle.read_formatted(dev(1), 1).await?, "50.00%");
        handle.write_formatted(dev(1), 1, "75%").await?;
        assert_eq!(handle.read_object(dev(1), 1).await?, vec![0, 85]);

        assert!(handle.ping(dev(1)).await?);
        assert!(!handle.ping(dev(9)).await?);
        assert!(handle.discover().await?);
        // a round is already running
        assert!(!handle.discover().await?);

        handle.shutdown()?;
        task.await??;
        assert!(handle.devices().await.is_err());
        Ok(())
    })
}
