//! Pager proxy tests: packet flow, fault servicing and the close rendezvous.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use super::*;
use crate::diag::counters;
use crate::object::types::port::{PAGER_VMO_COMPLETE, PAGER_VMO_DIRTY, PAGER_VMO_READ};
use crate::object::types::{Pager, Port, PortPacket, Vmo};
use crate::object::{KernelHandle, Status};
use crate::time::Deadline;

const KEY: u64 = 0x5a5a;

struct Fixture {
    vmo: KernelHandle<Vmo>,
    pager: KernelHandle<Pager>,
    port: KernelHandle<Port>,
}

fn no_timeout() -> PagerOvertimeConfig {
    PagerOvertimeConfig {
        overtime_wait: Duration::ZERO,
        overtime_timeout: Duration::ZERO,
    }
}

fn fixture(pages: usize, overtime: PagerOvertimeConfig) -> Fixture {
    crate::testing::init();
    let pager = Pager::with_overtime(overtime);
    let port = Port::new();
    let vmo = pager.create_vmo(port.clone(), KEY, pages * PAGE_SIZE).unwrap();
    Fixture {
        vmo: KernelHandle::new(vmo),
        pager: KernelHandle::new(pager),
        port: KernelHandle::new(port),
    }
}

impl Fixture {
    fn source(&self) -> Arc<PageSource> {
        self.vmo.dispatcher().page_source().unwrap().clone()
    }

    fn proxy(&self) -> Arc<PagerProxy> {
        self.pager.dispatcher().proxy_for(self.vmo.dispatcher()).unwrap()
    }

    fn next_packet(&self) -> PortPacket {
        self.port
            .dispatcher()
            .wait(Deadline::after(Duration::from_secs(5)))
            .unwrap()
    }
}

fn read_request(page: usize) -> Arc<PageRequest> {
    PageRequest::new(PageRequestType::Read, (page * PAGE_SIZE) as u64, PAGE_SIZE as u64)
}

#[test]
fn one_packet_in_flight_fifo() {
    let f = fixture(4, no_timeout());
    let source = f.source();
    let requests: Vec<_> = (0..3).map(read_request).collect();
    for request in &requests {
        source.get_page(request).unwrap();
    }

    let port = f.port.dispatcher();
    assert_eq!(port.len(), 1);
    let snapshot = f.proxy().snapshot();
    assert!(snapshot.packet_busy);
    assert_eq!(snapshot.active_offset, Some(0));
    assert_eq!(&snapshot.pending_offsets[..], &[4096, 8192]);

    for expected in [0u64, 4096, 8192] {
        assert!(port.len() <= 1);
        let packet = port.dequeue().unwrap();
        assert_eq!(packet.key, KEY);
        let request = packet.as_page_request().unwrap();
        assert_eq!(request.command, PAGER_VMO_READ);
        assert_eq!((request.offset, request.length), (expected, PAGE_SIZE as u64));
    }
    assert!(port.is_empty());
    assert!(!f.proxy().snapshot().packet_busy);
}

#[test]
fn clearing_requests() {
    let f = fixture(4, no_timeout());
    let source = f.source();
    let requests: Vec<_> = (0..3).map(read_request).collect();
    for request in &requests {
        source.get_page(request).unwrap();
    }

    // Pending: removed in place.
    source.cancel_request(&requests[2]);
    assert_eq!(f.proxy().snapshot().pending_len, 1);

    // Active with the packet still queued: withdrawn, next request takes the slot.
    source.cancel_request(&requests[0]);
    let snapshot = f.proxy().snapshot();
    assert_eq!(snapshot.active_offset, Some(4096));
    assert_eq!(snapshot.pending_len, 0);

    let packet = f.port.dispatcher().dequeue().unwrap();
    assert_eq!(packet.as_page_request().unwrap().offset, 4096);
    assert!(f.port.dispatcher().is_empty());
}

#[test]
fn swap_keeps_queue_position() {
    let f = fixture(4, no_timeout());
    let source = f.source();
    let first = read_request(0);
    let second = read_request(1);
    let replacement = read_request(3);
    source.get_page(&first).unwrap();
    source.get_page(&second).unwrap();
    source.swap_request(&second, &replacement);

    assert_eq!(&f.proxy().snapshot().pending_offsets[..], &[3 * PAGE_SIZE as u64]);
}

#[test]
fn fault_serviced_by_pager() {
    let f = fixture(2, no_timeout());
    let before = counters::PAGER_SUCCEEDED_REQUESTS.value();
    let vmo = f.vmo.dispatcher().clone();
    let reader = std::thread::spawn(move || {
        let mut buf = [0u8; 5];
        vmo.read(PAGE_SIZE, &mut buf).map(|()| buf)
    });

    let request = f.next_packet().as_page_request().unwrap();
    assert_eq!((request.offset, request.length), (4096, 4096));
    let mut data = vec![0u8; PAGE_SIZE];
    data[..5].copy_from_slice(b"paged");
    f.pager
        .dispatcher()
        .supply_pages(f.vmo.dispatcher(), request.offset, &data)
        .unwrap();

    assert_eq!(&reader.join().unwrap().unwrap(), b"paged");
    assert!(f.vmo.dispatcher().is_committed(1));
    assert!(!f.vmo.dispatcher().is_committed(0));
    assert!(counters::PAGER_SUCCEEDED_REQUESTS.value() > before);
}

#[test]
fn write_waits_for_dirty_ack() {
    let f = fixture(1, no_timeout());
    let vmo = f.vmo.dispatcher().clone();
    let writer = std::thread::spawn(move || vmo.write(0, b"dirty"));

    let read = f.next_packet().as_page_request().unwrap();
    assert_eq!(read.command, PAGER_VMO_READ);
    f.pager
        .dispatcher()
        .supply_pages(f.vmo.dispatcher(), 0, &vec![0u8; PAGE_SIZE])
        .unwrap();

    let dirty = f.next_packet().as_page_request().unwrap();
    assert_eq!(dirty.command, PAGER_VMO_DIRTY);
    f.pager
        .dispatcher()
        .dirty_pages(f.vmo.dispatcher(), 0, PAGE_SIZE as u64)
        .unwrap();
    writer.join().unwrap().unwrap();

    let mut buf = [0u8; 5];
    f.vmo.dispatcher().read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"dirty");
}

#[test]
fn failed_pages_fail_the_fault() {
    let f = fixture(1, no_timeout());
    let before = counters::PAGER_FAILED_REQUESTS.value();
    let vmo = f.vmo.dispatcher().clone();
    let reader = std::thread::spawn(move || vmo.read(0, &mut [0u8; 1]));

    f.next_packet();
    let pager = f.pager.dispatcher();
    assert_eq!(
        pager.fail_pages(f.vmo.dispatcher(), 0, PAGE_SIZE as u64, Status::TimedOut),
        Err(Status::InvalidArgs)
    );
    pager
        .fail_pages(f.vmo.dispatcher(), 0, PAGE_SIZE as u64, Status::Io)
        .unwrap();
    assert_eq!(reader.join().unwrap(), Err(Status::Io));
    assert!(counters::PAGER_FAILED_REQUESTS.value() > before);

    let stranger = Vmo::new(PAGE_SIZE).unwrap();
    assert_eq!(
        pager.supply_pages(&stranger, 0, &vec![0u8; PAGE_SIZE]),
        Err(Status::InvalidArgs)
    );
}

#[test]
fn unanswered_fault_times_out() {
    let f = fixture(
        1,
        PagerOvertimeConfig {
            overtime_wait: Duration::from_millis(2),
            overtime_timeout: Duration::from_millis(20),
        },
    );
    let timed_out = counters::PAGER_TIMED_OUT_REQUESTS.value();
    let overtime = counters::PAGER_OVERTIME_WAITS.value();

    let mut buf = [0u8; 1];
    assert_eq!(f.vmo.dispatcher().read(0, &mut buf), Err(Status::TimedOut));
    assert!(counters::PAGER_TIMED_OUT_REQUESTS.value() > timed_out);
    assert!(counters::PAGER_OVERTIME_WAITS.value() > overtime);

    // The timed out request was withdrawn, packet included.
    assert!(f.port.dispatcher().is_empty());
    assert!(!f.proxy().snapshot().packet_busy);
    assert_eq!(f.source().outstanding(), 0);
}

#[test]
fn detach_fails_faults_and_sends_complete() {
    let f = fixture(1, no_timeout());
    let vmo = f.vmo.dispatcher().clone();
    let reader = std::thread::spawn(move || vmo.read(0, &mut [0u8; 1]));

    assert_eq!(f.next_packet().as_page_request().unwrap().command, PAGER_VMO_READ);
    crate::testing::wait_until("fault registered", || f.source().outstanding() == 1);
    f.pager.dispatcher().detach_vmo(f.vmo.dispatcher()).unwrap();
    assert_eq!(reader.join().unwrap(), Err(Status::BadState));

    let complete = f.next_packet().as_page_request().unwrap();
    assert_eq!(complete.command, PAGER_VMO_COMPLETE);
    assert_eq!((complete.offset, complete.length), (0, 0));
    assert_eq!(f.vmo.dispatcher().read(0, &mut [0u8; 1]), Err(Status::BadState));
}

// Page source holders: the VMO, the proxy (until final release) and the test.

#[test]
fn vmo_closes_first_then_pager() {
    let Fixture { vmo, pager, port } = fixture(1, no_timeout());
    let source = vmo.dispatcher().page_source().unwrap().clone();
    assert_eq!(Arc::strong_count(&source), 3);

    drop(vmo);
    // Completion packet still queued: the proxy keeps the page source.
    assert_eq!(port.dispatcher().len(), 1);
    assert_eq!(Arc::strong_count(&source), 2);

    drop(pager);
    assert_eq!(Arc::strong_count(&source), 1);
    assert!(port.dispatcher().is_empty());
}

#[test]
fn pager_closes_first() {
    let Fixture { vmo, pager, port } = fixture(1, no_timeout());
    let source = vmo.dispatcher().page_source().unwrap().clone();

    drop(pager);
    assert!(source.is_closed());
    assert_eq!(Arc::strong_count(&source), 2);
    assert!(port.dispatcher().is_empty());
    assert_eq!(vmo.dispatcher().read(0, &mut [0u8; 1]), Err(Status::BadState));

    drop(vmo);
    assert_eq!(Arc::strong_count(&source), 1);
}

#[test]
fn complete_packet_freed_after_close() {
    let Fixture { vmo, pager, port } = fixture(1, no_timeout());
    let source = vmo.dispatcher().page_source().unwrap().clone();

    drop(vmo);
    assert_eq!(Arc::strong_count(&source), 2);
    assert_eq!(pager.dispatcher().proxy_count(), 1);

    let packet = port.dispatcher().dequeue().unwrap();
    assert_eq!(packet.as_page_request().unwrap().command, PAGER_VMO_COMPLETE);
    assert_eq!(Arc::strong_count(&source), 1);
    assert_eq!(pager.dispatcher().proxy_count(), 0);

    drop(pager);
    assert_eq!(Arc::strong_count(&source), 1);
}

#[test]
fn closed_port_does_not_block_release() {
    let Fixture { vmo, pager, port } = fixture(1, no_timeout());
    let source = vmo.dispatcher().page_source().unwrap().clone();

    drop(port);
    drop(vmo);
    assert_eq!(Arc::strong_count(&source), 1);
    assert_eq!(pager.dispatcher().proxy_count(), 0);
}
