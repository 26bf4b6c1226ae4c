/*!
 * Network Bootstrapper Tests
 * Bounded wait against a scripted link probe
 */

use pluginbox::sandbox::{wait_for_network, LinkSnapshot, SandboxError, WaitPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn loopback() -> LinkSnapshot {
    LinkSnapshot {
        index: 1,
        name: "lo".to_string(),
        loopback: true,
        up: true,
    }
}

fn veth() -> LinkSnapshot {
    LinkSnapshot {
        index: 7,
        name: "pbs4242".to_string(),
        loopback: false,
        up: false,
    }
}

#[tokio::test]
async fn test_timeout_when_interface_never_arrives() {
    let policy = WaitPolicy {
        max_wait: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
    };
    let started = Instant::now();

    let err = wait_for_network(policy, || async { Ok(vec![loopback()]) })
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, SandboxError::NetworkTimeout { .. }));
    assert_eq!(err.exit_code(), 125);
}

#[tokio::test]
async fn test_interface_arriving_late_is_used() {
    let polls = AtomicU32::new(0);
    let policy = WaitPolicy {
        max_wait: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
    };

    let link = wait_for_network(policy, || {
        let attempt = polls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 3 {
                Ok(vec![loopback()])
            } else {
                Ok(vec![loopback(), veth()])
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(link, veth());
    assert_eq!(polls.load(Ordering::SeqCst), 4);
}
