//! Integration tests for the bus interconnect.

mod common;

use common::TestPort;
use memsim::common::{AddrRange, SimError};
use memsim::mem::{connect, Dest, MemCmd, Packet, Port, Status};
use memsim::soc::{Bus, BusPort};
use std::rc::Rc;

/// A bus with an initiator on port 0 and two devices on ports 1 and 2.
struct Fixture {
    bus: Rc<Bus>,
    cpu: Rc<TestPort>,
    low: Rc<TestPort>,
    high: Rc<TestPort>,
}

fn attach(bus: &Rc<Bus>, dev: &Rc<TestPort>) -> Rc<BusPort> {
    let port = bus.get_port();
    connect(dev, &port).unwrap();
    port
}

fn fixture() -> Fixture {
    let bus = Bus::new("membus", 0);
    let cpu = TestPort::new("cpu", Vec::new());
    let low = TestPort::new("low", vec![AddrRange::new(0x0, 0xfff)]);
    let high = TestPort::new("high", vec![AddrRange::new(0x1000, 0x1fff)]);
    attach(&bus, &cpu);
    attach(&bus, &low);
    attach(&bus, &high);
    low.send_status_change(Status::RangeChange).unwrap();
    high.send_status_change(Status::RangeChange).unwrap();
    Fixture { bus, cpu, low, high }
}

/// Tests that ports are numbered and named in attach order.
#[test]
fn test_bus_ports() {
    let bus = Bus::new("membus", 3);
    let p0 = bus.get_port();
    let p1 = bus.get_port();
    assert_eq!(p0.id(), 0);
    assert_eq!(p1.id(), 1);
    assert_eq!(p1.name(), "membus-p1");
    assert_eq!(bus.num_ports(), 2);
    assert_eq!(bus.bus_id(), 3);
}

/// Tests that the bus learns its map from range announcements and tells
/// the other ports about each change.
#[test]
fn test_range_learning() {
    let f = fixture();
    let map = f.bus.port_list();
    assert_eq!(map.len(), 2);
    assert_eq!(map[0].port_id, 1);
    assert_eq!(map[0].range, AddrRange::new(0x0, 0xfff));
    assert_eq!(map[1].port_id, 2);

    assert_eq!(f.cpu.status_changes.get(), 2);
    assert_eq!(f.low.status_changes.get(), 1);
    assert_eq!(f.high.status_changes.get(), 1);

    let seen_by_cpu = f.cpu.peer_address_ranges().unwrap();
    assert_eq!(seen_by_cpu.resp.len(), 2);
    let seen_by_low = f.low.peer_address_ranges().unwrap();
    assert_eq!(seen_by_low.resp, vec![AddrRange::new(0x1000, 0x1fff)]);
}

/// Tests that a re-announcement replaces the port's old entries.
#[test]
fn test_range_reannouncement() {
    let f = fixture();
    f.low.send_status_change(Status::RangeChange).unwrap();
    assert_eq!(f.bus.port_list().len(), 2);
}

/// Tests that broadcast packets are routed by address and stamped with
/// their source port.
#[test]
fn test_timing_routing_by_address() {
    let f = fixture();
    let pkt = Packet::request(MemCmd::ReadReq, 0x1500, 8, 0);
    assert!(f.cpu.send_timing(pkt.clone()).unwrap());

    assert_eq!(f.high.received_addrs(), vec![0x1500]);
    assert!(f.low.received.borrow().is_empty());
    assert_eq!(pkt.borrow().src(), Some(0));
    assert_eq!(f.bus.stats().timing_packets, 1);
}

/// Tests that an address no device claims is fatal.
#[test]
fn test_unmapped_address() {
    let f = fixture();
    let pkt = Packet::request(MemCmd::ReadReq, 0x2000, 8, 0);
    let err = f.cpu.send_timing(pkt).unwrap_err();
    assert!(matches!(err, SimError::UnmappedAddress { addr: 0x2000, .. }));
}

/// Tests that a packet routed back to its own port is fatal.
#[test]
fn test_routing_loop() {
    let f = fixture();
    let pkt = Packet::request(MemCmd::ReadReq, 0x10, 8, 0);
    let err = f.low.send_timing(pkt).unwrap_err();
    assert!(matches!(err, SimError::RoutingLoop { port: 1, .. }));
}

/// Tests that responses follow their explicit destination.
#[test]
fn test_response_explicit_destination() {
    let f = fixture();
    let pkt = Packet::request(MemCmd::ReadReq, 0x1500, 8, 0);
    f.cpu.send_timing(pkt.clone()).unwrap();

    pkt.borrow_mut().make_timing_response().unwrap();
    assert_eq!(pkt.borrow().dest(), Dest::Port(0));
    assert!(f.high.send_timing(pkt.clone()).unwrap());
    assert_eq!(f.cpu.received.borrow().len(), 1);
    assert_eq!(pkt.borrow().cmd, MemCmd::ReadResp);
}

/// Tests that an explicit destination outside the port list is fatal.
#[test]
fn test_destination_out_of_bounds() {
    let f = fixture();
    let pkt = Packet::request(MemCmd::ReadReq, 0x1500, 8, 0);
    pkt.borrow_mut().set_dest(Dest::Port(9));
    let err = f.cpu.send_timing(pkt).unwrap_err();
    assert!(matches!(err, SimError::BadPortIndex { port: 9, count: 3, .. }));
}

/// Tests that overlapping announcements are rejected.
#[test]
fn test_overlapping_ranges() {
    let f = fixture();
    let rogue = TestPort::new("rogue", vec![AddrRange::new(0x800, 0x17ff)]);
    attach(&f.bus, &rogue);
    let err = rogue.send_status_change(Status::RangeChange).unwrap_err();
    assert!(matches!(
        err,
        SimError::OverlappingRanges { port: 3, owner: 1, .. }
    ));
}

/// Tests that refused senders are retried in the order they were refused.
#[test]
fn test_retry_fifo() {
    let f = fixture();
    let other = TestPort::new("other", Vec::new());
    attach(&f.bus, &other);
    f.high.accept.set(false);

    assert!(!f.cpu.send_timing(Packet::request(MemCmd::ReadReq, 0x1000, 8, 0)).unwrap());
    assert!(!other.send_timing(Packet::request(MemCmd::ReadReq, 0x1040, 8, 0)).unwrap());
    assert_eq!(f.bus.retry_list(), vec![0, 3]);
    assert_eq!(f.bus.stats().rejections, 2);

    f.high.accept.set(true);
    f.high.send_retry().unwrap();
    assert_eq!(f.cpu.retries.get(), 1);
    assert_eq!(other.retries.get(), 1);
    assert!(f.bus.retry_list().is_empty());
    assert_eq!(f.bus.stats().retries, 2);
}

/// Tests that a sender refused again during a retry pass waits for the
/// next pass instead of being retried twice.
#[test]
fn test_retry_once_per_pass() {
    let f = fixture();
    let other = TestPort::new("other", Vec::new());
    attach(&f.bus, &other);
    f.high.accept.set(false);

    let a = Packet::request(MemCmd::ReadReq, 0x1000, 8, 0);
    let b = Packet::request(MemCmd::ReadReq, 0x1040, 8, 0);
    f.cpu.send_timing(a.clone()).unwrap();
    other.send_timing(b.clone()).unwrap();
    *f.cpu.resend.borrow_mut() = Some(a);
    *other.resend.borrow_mut() = Some(b);

    f.high.send_retry().unwrap();
    assert_eq!(f.cpu.retries.get(), 1);
    assert_eq!(other.retries.get(), 1);
    assert_eq!(f.bus.retry_list(), vec![0, 3]);

    f.high.accept.set(true);
    f.high.send_retry().unwrap();
    assert_eq!(f.cpu.retries.get(), 2);
    assert_eq!(other.retries.get(), 2);
    assert_eq!(f.high.received_addrs(), vec![0x1000, 0x1040]);
    assert!(f.bus.retry_list().is_empty());
}

/// Tests atomic and functional routing.
#[test]
fn test_atomic_and_functional_routing() {
    let f = fixture();
    let pkt = Packet::request(MemCmd::ReadReq, 0x20, 8, 0);
    assert_eq!(f.cpu.send_atomic(&pkt).unwrap(), 7);
    let pkt = Packet::request(MemCmd::ReadReq, 0x1020, 8, 0);
    f.cpu.send_functional(&pkt).unwrap();

    assert_eq!(f.low.received_addrs(), vec![0x20]);
    assert_eq!(f.high.received_addrs(), vec![0x1020]);
    let stats = f.bus.stats();
    assert_eq!(stats.atomic_accesses, 1);
    assert_eq!(stats.functional_accesses, 1);
}

/// Tests that atomic accesses must be routed by address.
#[test]
fn test_atomic_with_destination_rejected() {
    let f = fixture();
    let pkt = Packet::request(MemCmd::ReadReq, 0x20, 8, 0);
    pkt.borrow_mut().set_dest(Dest::Port(1));
    assert!(matches!(
        f.cpu.send_atomic(&pkt),
        Err(SimError::Protocol { .. })
    ));
}

/// Tests that a port is bound only once.
#[test]
fn test_connect_twice() {
    let bus = Bus::new("membus", 0);
    let dev = TestPort::new("dev", Vec::new());
    let port = bus.get_port();
    connect(&dev, &port).unwrap();
    let again = bus.get_port();
    assert!(matches!(
        connect(&dev, &again),
        Err(SimError::AlreadyConnected { .. })
    ));
}

/// Tests that an unbound port reports itself.
#[test]
fn test_unconnected_port() {
    let dev = TestPort::new("lonely", Vec::new());
    let pkt = Packet::request(MemCmd::ReadReq, 0x20, 8, 0);
    assert!(matches!(
        dev.send_timing(pkt),
        Err(SimError::Unconnected { .. })
    ));
}
