//! End-to-end replay tests: a captured byte stream on disk, played through
//! [`FileReplayer`] into the bus engine, must yield exactly the frames the
//! capture contains and leave the engine in its terminal state once the file
//! runs dry.

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use infinibus::bus::{Bus, BusState};
use infinibus::frame::{Frame, OpCode};
use infinibus::transceiver::FileReplayer;

fn capture_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("tempfile");
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
    f
}

fn wait_for_invalid(bus: &Bus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while bus.state() != BusState::Invalid {
        assert!(Instant::now() < deadline, "bus never reached INVALID");
        thread::sleep(Duration::from_millis(1));
    }
}

fn run_capture(capture: &[u8]) -> (Vec<Frame>, Bus) {
    let file = capture_file(capture);
    let mut bus = Bus::new(Box::new(FileReplayer::new(file.path())));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.probe(move |frame| sink.lock().unwrap().push(frame.clone()))
        .unwrap();
    bus.start().unwrap();
    wait_for_invalid(&bus);
    bus.shutdown().unwrap();
    let frames = seen.lock().unwrap().clone();
    (frames, bus)
}

#[test]
fn single_frame_capture_dispatches_exactly_once() {
    let frame = Frame::new(0x0001, 0xf1f1, OpCode::ReadTableBlock, vec![0x00, 0x01, 0x01]);
    let (frames, bus) = run_capture(&frame.encode());

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.destination, 0x0001);
    assert_eq!(frames[0].header.source, 0xf1f1);
    assert_eq!(frames[0].header.operation, OpCode::ReadTableBlock);
    assert_eq!(frames[0].payload(), &[0x00, 0x01, 0x01]);
    assert_eq!(bus.state(), BusState::Invalid);
}

#[test]
fn noisy_capture_yields_frames_in_stream_order() {
    let f1 = Frame::new(0x0001, 0xf1f1, OpCode::ReadTableBlock, vec![0x00, 0x01, 0x01]);
    let f2 = Frame::new(0xf1f1, 0x2001, OpCode::Ack06, vec![0x55, 0xaa]);
    let f3 = Frame::new(0x2001, 0xf1f1, OpCode::ReadVariable, Vec::new());

    let mut capture = vec![0x01, 0x02, 0x03];
    capture.extend(f1.encode());
    capture.extend([0x04, 0x03, 0x02, 0x01, 0x05]);
    capture.extend(f2.encode());
    capture.extend(f3.encode());
    // Idle chatter at the tail flushes misaligned candidates whose declared
    // length points past the end of the capture.
    capture.extend([0x01; 300]);

    let (frames, bus) = run_capture(&capture);
    assert_eq!(frames, vec![f1, f2, f3]);
    assert_eq!(bus.state(), BusState::Invalid);
}

#[test]
fn invalid_bus_still_accepts_shutdown() {
    let frame = Frame::new(0x0001, 0xf1f1, OpCode::Ack02, Vec::new());
    let (_, mut bus) = run_capture(&frame.encode());

    // run_capture already shut the bus down once; doing it again from the
    // terminal state must stay safe.
    bus.shutdown().unwrap();
    assert_eq!(bus.state(), BusState::Invalid);
}
