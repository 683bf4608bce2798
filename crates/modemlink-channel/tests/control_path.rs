mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use common::{device, device_with, framed, recv, CountingHooks};
use modemlink_channel::{
    ChannelOptions, ChannelState, DeviceId, DeviceTable, LinkConfig, LinkError, Receipt,
};
use modemlink_queue::{Terminator, CR};

#[test]
fn first_open_is_current_second_is_inactive() {
    let (_port, device) = device();
    let a = framed(&device, 64, 20);
    let b = framed(&device, 64, 20);
    assert!(a.is_current());
    assert!(!b.is_current());
    assert_eq!(b.state(), ChannelState::Initialized);
    assert_eq!(a.other_channel().unwrap().unwrap().id(), b.id());
    assert_eq!(b.other_channel().unwrap().unwrap().id(), a.id());
}

#[test]
fn selection_isolates_partial_messages() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    let b = framed(&device, 64, 20);

    port.inject(b"+CR");
    b.select().unwrap();
    assert!(b.is_current());
    assert_eq!(b.state(), ChannelState::Active);
    port.inject(b"OK\r");

    a.select().unwrap();
    port.inject(b"EG: 1\r");

    assert_eq!(recv(&a).unwrap(), b"+CREG: 1\r");
    assert!(recv(&a).is_none());
    assert_eq!(recv(&b).unwrap(), b"OK\r");
    assert!(recv(&b).is_none());
}

#[test]
fn selecting_current_channel_is_a_noop() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    let arms = port.arm_count();
    a.select().unwrap();
    a.select().unwrap();
    assert!(a.is_current());
    assert_eq!(port.arm_count(), arms);
}

#[test]
fn close_twice_reports_not_initialized() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    port.inject(b"AT\r");

    a.close().unwrap();
    assert!(matches!(a.close(), Err(LinkError::NotInitialized)));
    assert_eq!(a.state(), ChannelState::Uninitialized);
    assert_eq!(device.open_channels(), 0);

    let mut out = BytesMut::new();
    assert_eq!(a.receive(&mut out).unwrap(), Receipt::Closed);
    assert!(matches!(a.send(b"AT\r"), Err(LinkError::NotInitialized)));
    assert!(matches!(a.free_bytes(), Err(LinkError::NotInitialized)));
    assert!(matches!(a.select(), Err(LinkError::NotInitialized)));

    let again = framed(&device, 64, 20);
    assert!(again.is_current());
    port.inject(b"OK\r");
    assert_eq!(recv(&again).unwrap(), b"OK\r");
}

#[test]
fn handoff_under_traffic_loses_no_bytes() {
    let (port, device) = device();
    let a = device.open(ChannelOptions::stream()).unwrap();
    let b = device.open(ChannelOptions::stream()).unwrap();
    let total = 1000u64;

    let feeder = {
        let port = Arc::clone(&port);
        thread::spawn(move || {
            for n in 0..total {
                port.inject(&[b'0' + (n % 10) as u8]);
            }
        })
    };
    while !feeder.is_finished() {
        b.select().unwrap();
        a.select().unwrap();
    }
    feeder.join().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while port.pending_len() > 0 && Instant::now() < deadline {
        port.pump();
        thread::yield_now();
    }

    let received: u64 = [&a, &b]
        .iter()
        .map(|handle| handle.stats().stream.unwrap().total_received)
        .sum();
    assert_eq!(received, total);
    assert_eq!(device.stats().dropped, 0);
}

#[test]
fn closing_current_promotes_inactive() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    let b = framed(&device, 64, 20);

    a.close().unwrap();
    assert!(b.is_current());
    assert!(b.other_channel().unwrap().is_none());
    port.inject(b"RDY\r");
    assert_eq!(recv(&b).unwrap(), b"RDY\r");
}

#[test]
fn closing_inactive_leaves_current_alone() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    let b = framed(&device, 64, 20);
    port.inject(b"AT");

    b.close().unwrap();
    assert!(a.is_current());
    port.inject(b"\r");
    assert_eq!(recv(&a).unwrap(), b"AT\r");
}

#[test]
fn close_wakes_blocked_receiver() {
    let (_port, device) = device();
    let a = framed(&device, 64, 20);

    let waiter = {
        let a = a.clone();
        thread::spawn(move || {
            let mut out = BytesMut::new();
            a.receive_blocking(&mut out).unwrap()
        })
    };
    thread::sleep(Duration::from_millis(30));
    a.close().unwrap();
    assert_eq!(waiter.join().unwrap(), Receipt::Closed);
}

#[test]
fn send_transmits_and_completes() {
    let (port, device) = device();
    let hooks = Arc::new(CountingHooks::default());
    let a = device
        .open(ChannelOptions::framed(Terminator(CR)).with_hooks(hooks.clone()))
        .unwrap();

    a.send(b"AT+CSQ\r").unwrap();
    assert_eq!(port.transmitted(), vec![b"AT+CSQ\r".to_vec()]);
    assert!(a.transmit_pending());
    assert!(matches!(
        a.wait_transmit(Duration::from_millis(20)),
        Err(LinkError::TimedOut(_))
    ));

    assert!(port.complete_transmit());
    assert!(!a.transmit_pending());
    assert_eq!(hooks.transmits(), 1);
    a.wait_transmit(Duration::from_millis(20)).unwrap();
}

#[test]
fn wait_transmit_wakes_on_completion() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    a.send(b"ATI\r").unwrap();

    let completer = {
        let port = Arc::clone(&port);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            port.complete_transmit();
        })
    };
    a.wait_transmit(Duration::from_secs(5)).unwrap();
    completer.join().unwrap();
}

#[test]
fn send_retries_while_busy() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    port.refuse_next_transmits(3);

    let started = Instant::now();
    a.send(b"AT\r").unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(port.transmitted().len(), 1);
}

#[test]
fn send_times_out_when_interface_stays_busy() {
    let config = LinkConfig {
        send_timeout_ms: 50,
        ..LinkConfig::default()
    };
    let (port, device) = device_with(config);
    let a = framed(&device, 64, 20);
    port.set_stuck_busy(true);

    let started = Instant::now();
    let err = a.send(b"AT\r").unwrap_err();
    assert!(matches!(err, LinkError::TimedOut(d) if d == Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!a.transmit_pending());
    assert!(port.transmitted().is_empty());
}

#[test]
fn second_send_waits_for_first_completion() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    a.send(b"AT\r").unwrap();

    let completer = {
        let port = Arc::clone(&port);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            port.complete_transmit();
        })
    };
    a.send(b"ATI\r").unwrap();
    completer.join().unwrap();

    assert_eq!(port.transmitted().len(), 2);
    assert!(a.transmit_pending());
    port.complete_transmit();
    assert!(!a.transmit_pending());
    assert_eq!(a.stats().transmits_completed, 2);
}

#[test]
fn send_rejects_empty_and_unselected() {
    let (_port, device) = device();
    let a = framed(&device, 64, 20);
    let b = framed(&device, 64, 20);
    assert!(matches!(a.send(b""), Err(LinkError::InvalidArgument(_))));
    assert!(matches!(b.send(b"AT\r"), Err(LinkError::InvalidArgument(_))));
    b.select().unwrap();
    b.send(b"AT\r").unwrap();
}

#[test]
fn close_aborts_inflight_transmit() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    a.send(b"AT\r").unwrap();
    assert!(port.is_transmitting());
    a.close().unwrap();
    assert!(!port.is_transmitting());

    let b = framed(&device, 64, 20);
    b.send(b"ATI\r").unwrap();
}

#[test]
fn stalled_receive_is_rearmed_once_by_send() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);

    port.refuse_next_arms(1);
    port.inject(b"A");
    assert!(!port.is_armed());
    assert_eq!(device.stats().stalls, 1);

    let arms = port.arm_count();
    a.send(b"AT\r").unwrap();
    assert!(port.is_armed());
    assert_eq!(port.arm_count(), arms + 1);

    // the completion finds nothing stalled and arms nothing
    port.complete_transmit();
    assert_eq!(port.arm_count(), arms + 1);
}

#[test]
fn stalled_receive_is_rearmed_by_transmit_completion() {
    let (port, device) = device();
    let a = framed(&device, 64, 20);
    a.send(b"AT\r").unwrap();

    port.refuse_next_arms(1);
    port.inject(b"O");
    assert!(!port.is_armed());

    let arms = port.arm_count();
    assert!(port.complete_transmit());
    assert!(port.is_armed());
    assert_eq!(port.arm_count(), arms + 1);

    port.inject(b"K\r");
    assert_eq!(recv(&a).unwrap(), b"OK\r");
}

#[test]
fn table_lifecycle() {
    let table = DeviceTable::new(LinkConfig::default()).unwrap();
    let port = modemlink_transport::SimulatedUart::new("uart1");
    table.init(DeviceId(1), port.clone()).unwrap();

    let a = table
        .open(DeviceId(1), ChannelOptions::framed(Terminator(CR)))
        .unwrap();
    let b = table.open(DeviceId(1), ChannelOptions::stream()).unwrap();
    port.inject(b"AT\r");
    b.select().unwrap();
    port.inject(b"raw");

    assert_eq!(recv(&a).unwrap(), b"AT\r");
    let mut buf = [0u8; 8];
    assert_eq!(b.stream_receive(&mut buf).unwrap(), 3);

    let stats = table.get(DeviceId(1)).unwrap().channel_stats();
    assert_eq!(stats.len(), 2);
    assert!(stats[0].current);

    table.deinit(DeviceId(1)).unwrap();
    assert!(matches!(a.close(), Err(LinkError::NotInitialized)));
    assert!(matches!(
        table.open(DeviceId(1), ChannelOptions::stream()),
        Err(LinkError::InvalidArgument(_))
    ));
}
