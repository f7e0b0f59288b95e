//! Drives the DFU engine against a scripted STM32-bootloader-style fake
//! behind the control-transfer transport trait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fwflash::error::TransportError;
use fwflash::protocols::dfu::DfuEngine;
use fwflash::transport::DfuBus;
use fwflash::{CancelToken, Element, FlashError};

const DFU_DNLOAD: u8 = 1;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

const STATE_IDLE: u8 = 0x02;
const STATE_DOWNLOAD_BUSY: u8 = 0x04;
const STATE_DOWNLOAD_IDLE: u8 = 0x05;
const STATE_MANIFEST: u8 = 0x07;
const STATE_ERROR: u8 = 0x0A;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    MassErase,
    PageErase(u32),
    SetAddress(u32),
    Write(usize),
    Leave,
    ClearStatus,
    Abort,
}

struct FakeBootloader {
    ops: Vec<Op>,
    status_queue: VecDeque<u8>,
    default_state: u8,
    layout: String,
    layout_reads: usize,
    transfer_size: u16,
    /// Report this state instead of DOWNLOAD_BUSY after a write chunk.
    break_writes_with: Option<u8>,
    /// Report this state instead of MANIFEST after the leave command.
    manifest_state: u8,
}

impl FakeBootloader {
    fn new(layout: &str, transfer_size: u16) -> Self {
        FakeBootloader {
            ops: Vec::new(),
            status_queue: VecDeque::from([STATE_IDLE]),
            default_state: STATE_IDLE,
            layout: layout.to_string(),
            layout_reads: 0,
            transfer_size,
            break_writes_with: None,
            manifest_state: STATE_MANIFEST,
        }
    }

    fn queue_command_statuses(&mut self) {
        self.status_queue.push_back(STATE_DOWNLOAD_BUSY);
        self.status_queue.push_back(STATE_DOWNLOAD_IDLE);
    }
}

struct FakeBus {
    state: Arc<Mutex<FakeBootloader>>,
}

impl DfuBus for FakeBus {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut device = self.state.lock().unwrap();
        match request {
            DFU_DNLOAD if data.is_empty() => {
                device.ops.push(Op::Leave);
                let manifest = device.manifest_state;
                device.status_queue.push_back(manifest);
            }
            DFU_DNLOAD if value >= 2 => {
                device.ops.push(Op::Write(data.len()));
                if let Some(state) = device.break_writes_with {
                    device.status_queue.push_back(state);
                } else {
                    device.queue_command_statuses();
                }
            }
            DFU_DNLOAD => {
                match data[0] {
                    0x41 if data.len() == 1 => device.ops.push(Op::MassErase),
                    0x41 => device.ops.push(Op::PageErase(u32::from_le_bytes(
                        data[1..5].try_into().unwrap(),
                    ))),
                    0x21 => device.ops.push(Op::SetAddress(u32::from_le_bytes(
                        data[1..5].try_into().unwrap(),
                    ))),
                    other => panic!("unexpected DNLOAD command byte {:#04x}", other),
                }
                device.queue_command_statuses();
            }
            DFU_CLRSTATUS => device.ops.push(Op::ClearStatus),
            DFU_ABORT => {
                device.ops.push(Op::Abort);
                device.status_queue.push_back(STATE_IDLE);
            }
            other => panic!("unexpected OUT request {:#04x}", other),
        }
        Ok(())
    }

    fn control_in(
        &mut self,
        request: u8,
        _value: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        assert_eq!(request, DFU_GETSTATUS);
        let mut device = self.state.lock().unwrap();
        let state = device
            .status_queue
            .pop_front()
            .unwrap_or(device.default_state);
        buf[..6].copy_from_slice(&[0, 0, 0, 0, state, 0]);
        Ok(6)
    }

    fn read_string(&mut self, _index: u8) -> Result<String, TransportError> {
        Ok(String::new())
    }

    fn memory_layout(&mut self) -> Result<String, TransportError> {
        let mut device = self.state.lock().unwrap();
        device.layout_reads += 1;
        Ok(device.layout.clone())
    }

    fn transfer_size(&self) -> u16 {
        self.state.lock().unwrap().transfer_size
    }
}

fn engine_for(device: &Arc<Mutex<FakeBootloader>>, cancel: CancelToken) -> DfuEngine {
    let bus = FakeBus {
        state: Arc::clone(device),
    };
    let mut engine = DfuEngine::with_bus(Box::new(bus), cancel);
    engine.settle().unwrap();
    engine
}

#[test]
fn single_element_erases_one_page_and_chunks_writes() {
    let device = Arc::new(Mutex::new(FakeBootloader::new(
        "@Internal Flash/0x08000000/01*016Kg",
        256,
    )));
    let mut engine = engine_for(&device, CancelToken::new());

    let element = Element {
        address: 0x0800_0000,
        data: vec![0x5A; 1024],
    };
    let mut events: Vec<(u32, u32, u32)> = Vec::new();
    engine
        .program(&[element], &mut |addr, done, size| {
            events.push((addr, done, size))
        })
        .unwrap();

    let device = device.lock().unwrap();
    let erases: Vec<&Op> = device
        .ops
        .iter()
        .filter(|op| matches!(op, Op::PageErase(_)))
        .collect();
    assert_eq!(erases, vec![&Op::PageErase(0x0800_0000)]);

    let set_addresses: Vec<u32> = device
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::SetAddress(addr) => Some(*addr),
            _ => None,
        })
        .collect();
    assert_eq!(
        set_addresses,
        vec![
            0x0800_0000,
            0x0800_0100,
            0x0800_0200,
            0x0800_0300,
            0x0800_0000, // jump target for the exit sequence
        ]
    );

    let writes: Vec<usize> = device
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::Write(len) => Some(*len),
            _ => None,
        })
        .collect();
    assert_eq!(writes, vec![256, 256, 256, 256]);
    assert_eq!(device.ops.last(), Some(&Op::Leave));
    assert_eq!(device.layout_reads, 1);

    assert_eq!(events.first(), Some(&(0x0800_0000, 0, 1024)));
    assert_eq!(events.last(), Some(&(0x0800_0000, 1024, 1024)));
    assert!(events.windows(2).all(|w| w[0].1 <= w[1].1));
}

#[test]
fn element_spanning_pages_erases_each_page_once() {
    let device = Arc::new(Mutex::new(FakeBootloader::new(
        "@Internal Flash/0x08000000/02*001Kg",
        512,
    )));
    let mut engine = engine_for(&device, CancelToken::new());

    let element = Element {
        address: 0x0800_0000,
        data: vec![0x33; 1536],
    };
    engine.program(&[element], &mut |_, _, _| {}).unwrap();

    let erases: Vec<u32> = device
        .lock()
        .unwrap()
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::PageErase(addr) => Some(*addr),
            _ => None,
        })
        .collect();
    assert_eq!(erases, vec![0x0800_0000, 0x0800_0400]);
}

#[test]
fn mass_erase_skips_the_layout_and_page_erases() {
    let device = Arc::new(Mutex::new(FakeBootloader::new(
        "@Internal Flash/0x08000000/01*016Kg",
        1024,
    )));
    let mut engine = engine_for(&device, CancelToken::new());
    engine.mass_erase(true);

    let element = Element {
        address: 0x0800_0000,
        data: vec![0x77; 2048],
    };
    engine.program(&[element], &mut |_, _, _| {}).unwrap();

    let device = device.lock().unwrap();
    assert_eq!(device.ops.first(), Some(&Op::MassErase));
    assert!(!device.ops.iter().any(|op| matches!(op, Op::PageErase(_))));
    assert_eq!(device.layout_reads, 0);
}

#[test]
fn address_outside_the_layout_is_a_protocol_error() {
    let device = Arc::new(Mutex::new(FakeBootloader::new(
        "@Internal Flash/0x08000000/01*016Kg",
        1024,
    )));
    let mut engine = engine_for(&device, CancelToken::new());

    let element = Element {
        address: 0x2000_0000,
        data: vec![0x00; 64],
    };
    let err = engine.program(&[element], &mut |_, _, _| {}).unwrap_err();
    assert!(matches!(err, FlashError::Protocol(_)));
}

#[test]
fn broken_busy_idle_contract_names_the_stage_and_state() {
    let device = Arc::new(Mutex::new(FakeBootloader::new(
        "@Internal Flash/0x08000000/01*016Kg",
        1024,
    )));
    device.lock().unwrap().break_writes_with = Some(STATE_ERROR);
    let mut engine = engine_for(&device, CancelToken::new());

    let element = Element {
        address: 0x0800_0000,
        data: vec![0x11; 128],
    };
    let err = engine.program(&[element], &mut |_, _, _| {}).unwrap_err();
    match err {
        FlashError::Protocol(message) => {
            assert!(message.contains("Write memory failed"));
            assert!(message.contains("STATE_DFU_ERROR"));
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[test]
fn settle_clears_an_error_state() {
    let device = Arc::new(Mutex::new(FakeBootloader::new("@Flash/0x08000000/01*016Kg", 1024)));
    {
        let mut device = device.lock().unwrap();
        device.status_queue = VecDeque::from([STATE_ERROR, STATE_IDLE]);
    }
    let _engine = engine_for(&device, CancelToken::new());

    assert_eq!(device.lock().unwrap().ops, vec![Op::ClearStatus]);
}

#[test]
fn settle_aborts_a_stale_download_state() {
    let device = Arc::new(Mutex::new(FakeBootloader::new("@Flash/0x08000000/01*016Kg", 1024)));
    {
        let mut device = device.lock().unwrap();
        device.status_queue = VecDeque::from([STATE_DOWNLOAD_IDLE]);
    }
    let _engine = engine_for(&device, CancelToken::new());

    assert_eq!(device.lock().unwrap().ops, vec![Op::Abort]);
}

#[test]
fn settle_gives_up_after_four_attempts() {
    let device = Arc::new(Mutex::new(FakeBootloader::new("@Flash/0x08000000/01*016Kg", 1024)));
    {
        let mut device = device.lock().unwrap();
        device.status_queue.clear();
        device.default_state = STATE_ERROR;
    }
    let bus = FakeBus {
        state: Arc::clone(&device),
    };
    let mut engine = DfuEngine::with_bus(Box::new(bus), CancelToken::new());

    let err = engine.settle().unwrap_err();
    assert!(matches!(err, FlashError::Protocol(_)));
    assert_eq!(device.lock().unwrap().ops.len(), 4);
}

#[test]
fn missing_manifest_state_after_exit_is_not_fatal() {
    let device = Arc::new(Mutex::new(FakeBootloader::new(
        "@Internal Flash/0x08000000/01*016Kg",
        1024,
    )));
    device.lock().unwrap().manifest_state = STATE_IDLE;
    let mut engine = engine_for(&device, CancelToken::new());

    let element = Element {
        address: 0x0800_0000,
        data: vec![0x42; 64],
    };
    engine.program(&[element], &mut |_, _, _| {}).unwrap();
    assert_eq!(device.lock().unwrap().ops.last(), Some(&Op::Leave));
}

#[test]
fn cancellation_stops_before_the_next_chunk() {
    let device = Arc::new(Mutex::new(FakeBootloader::new(
        "@Internal Flash/0x08000000/01*016Kg",
        256,
    )));
    let cancel = CancelToken::new();
    let mut engine = engine_for(&device, cancel.clone());

    let element = Element {
        address: 0x0800_0000,
        data: vec![0x99; 1024],
    };
    let cancel_in_callback = cancel.clone();
    let err = engine
        .program(&[element], &mut move |_, done, _| {
            if done >= 512 {
                cancel_in_callback.cancel();
            }
        })
        .unwrap_err();
    assert!(matches!(err, FlashError::Cancelled));

    let device = device.lock().unwrap();
    let writes = device
        .ops
        .iter()
        .filter(|op| matches!(op, Op::Write(_)))
        .count();
    assert_eq!(writes, 2);
    assert!(!device.ops.contains(&Op::Leave));
}
