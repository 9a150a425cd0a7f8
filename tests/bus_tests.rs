use telepilot::bus::{EventBus, Topic};
use telepilot::vehicle::{DriveMode, RemoteState};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn rc(steering: f32) -> RemoteState {
    RemoteState {
        mode: DriveMode::Driving,
        steering,
        throttle: 0.0,
        recording: false,
    }
}

#[tokio::test]
async fn test_every_subscriber_sees_every_payload() {
    let bus = EventBus::new();
    let mut rx_a = bus.rc_state.subscribe();
    let mut rx_b = bus.rc_state.subscribe();
    assert_eq!(bus.rc_state.subscriber_count(), 2);

    bus.rc_state.publish(rc(0.25));
    bus.rc_state.publish(rc(0.75));

    for rx in [&mut rx_a, &mut rx_b] {
        assert_eq!(rx.recv().await.unwrap().steering, 0.25);
        assert_eq!(rx.recv().await.unwrap().steering, 0.75);
    }
}

#[tokio::test]
async fn test_payloads_arrive_in_publish_order() {
    let bus = EventBus::new();
    let mut rx = bus.state_update.subscribe();

    let mut vehicle = telepilot::vehicle::Vehicle::default();
    for batch in 1..=10 {
        vehicle.batch = batch;
        bus.state_update.publish(vehicle.clone());
    }

    for batch in 1..=10 {
        assert_eq!(rx.recv().await.unwrap().batch, batch);
    }
}

#[tokio::test]
async fn test_publish_without_subscribers_is_silent() {
    let bus = EventBus::new();
    assert_eq!(bus.camera_frame.subscriber_count(), 0);

    // Nothing to assert beyond "does not panic"; the payload is dropped.
    bus.camera_frame.publish(vec![1, 2, 3]);

    // A late subscriber starts from the next publish, not from history.
    let mut rx = bus.camera_frame.subscribe();
    bus.camera_frame.publish(vec![4, 5, 6]);
    assert_eq!(rx.recv().await.unwrap(), vec![4, 5, 6]);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_slow_subscriber_loses_oldest_payloads() {
    let topic: Topic<u32> = Topic::new("slow", 2);
    let mut rx = topic.subscribe();

    for n in 0..5 {
        topic.publish(n);
    }

    // Capacity 2 keeps only the newest two; the receiver is told how many
    // it missed and then catches up.
    assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    assert_eq!(rx.recv().await.unwrap(), 3);
    assert_eq!(rx.recv().await.unwrap(), 4);
}

#[tokio::test]
async fn test_topics_are_isolated() {
    let bus = EventBus::new();
    let mut state_rx = bus.state_update.subscribe();

    bus.rc_state.publish(rc(0.5));
    bus.camera_frame.publish(vec![9]);

    assert!(matches!(state_rx.try_recv(), Err(TryRecvError::Empty)));
}
