//! Micro-checkpoint replication: the primary-side loop and the standby
//! receiver.
//!
//! The primary pauses the guest for a few milliseconds each tick, stages a
//! full state snapshot, resumes, streams the snapshot to the standby and
//! commits it two-phase. Guest network output produced after a snapshot is
//! held behind a traffic barrier until the covering snapshot is
//! acknowledged, so nothing externally visible ever outruns replicated
//! state. The checkpoint channel is anything `Read + Write` - a TCP socket
//! or an RDMA control stream.

pub mod config;
pub mod primary;
pub mod proto;
pub mod secondary;

pub use config::McConfig;
pub use primary::{McHandle, McLoop, McState, McStats};
pub use proto::Sentinel;
pub use secondary::McReceiver;

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("replication stream error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected control word {0:#x}")]
    BadSentinel(u32),
    #[error("peer sent {got:?}, expected {expected:?}")]
    UnexpectedSentinel { expected: Sentinel, got: Sentinel },
    #[error("hypervisor error: {0}")]
    Vm(#[from] vmshim::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use netplug::{ShaperBackend, TrafficBuffer};
    use primary::{McLoop, McState};
    use proto::Sentinel;
    use secondary::McReceiver;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;
    use vmshim::{GuestControl, NicInfo, RamBlockDesc, VmHandle};

    struct TestVm {
        payload: Vec<u8>,
        running: bool,
        clock: AtomicU64,
        loaded: Vec<Vec<u8>>,
    }

    impl TestVm {
        fn new(payload: Vec<u8>) -> Self {
            TestVm {
                payload,
                running: true,
                clock: AtomicU64::new(0),
                loaded: Vec::new(),
            }
        }
    }

    impl GuestControl for TestVm {
        fn stop(&mut self) -> vmshim::Result<()> {
            assert!(self.running, "double stop");
            self.running = false;
            Ok(())
        }

        fn start(&mut self) -> vmshim::Result<()> {
            assert!(!self.running, "double start");
            self.running = true;
            Ok(())
        }

        fn save_state_begin(&mut self, w: &mut dyn Write) -> vmshim::Result<()> {
            assert!(!self.running, "state saved while the guest runs");
            w.write_all(b"MCHD")?;
            Ok(())
        }

        fn save_state_complete(&mut self, w: &mut dyn Write) -> vmshim::Result<()> {
            assert!(!self.running, "state saved while the guest runs");
            w.write_all(&self.payload)?;
            Ok(())
        }

        fn load_state(&mut self, r: &mut dyn Read) -> vmshim::Result<()> {
            let mut state = Vec::new();
            r.read_to_end(&mut state)?;
            self.loaded.push(state);
            Ok(())
        }

        fn nics(&self) -> Vec<NicInfo> {
            vec![NicInfo {
                name: "net0".to_string(),
                peer_name: Some("tap7".to_string()),
            }]
        }

        fn ram_blocks(&self) -> Vec<RamBlockDesc> {
            Vec::new()
        }

        fn clock_ms(&self) -> u64 {
            self.clock.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Op {
        Create,
        Barrier,
        ReleaseOne,
        ReleaseAll,
        Destroy,
    }

    #[derive(Clone, Default)]
    struct RecordingShaper {
        ops: Arc<Mutex<Vec<Op>>>,
    }

    impl ShaperBackend for RecordingShaper {
        fn create_plug(&mut self, _dev: &str, _limit: u32) -> std::io::Result<()> {
            self.ops.lock().unwrap().push(Op::Create);
            Ok(())
        }

        fn insert_barrier(&mut self, _dev: &str) -> std::io::Result<()> {
            self.ops.lock().unwrap().push(Op::Barrier);
            Ok(())
        }

        fn release_one(&mut self, _dev: &str) -> std::io::Result<()> {
            self.ops.lock().unwrap().push(Op::ReleaseOne);
            Ok(())
        }

        fn release_indefinite(&mut self, _dev: &str) -> std::io::Result<()> {
            self.ops.lock().unwrap().push(Op::ReleaseAll);
            Ok(())
        }

        fn destroy(&mut self, _dev: &str) -> std::io::Result<()> {
            self.ops.lock().unwrap().push(Op::Destroy);
            Ok(())
        }

        fn buffer_usage(&mut self, _dev: &str) -> std::io::Result<u64> {
            Ok(0)
        }
    }

    fn vm_handle(vm: TestVm) -> VmHandle {
        Arc::new(Mutex::new(vm))
    }

    fn fast_cfg() -> McConfig {
        McConfig {
            freq_ms: 2,
            ..McConfig::default()
        }
    }

    #[test]
    fn steady_state_replication_and_orderly_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let cfg = fast_cfg();

        let recv_vm = Arc::new(Mutex::new(TestVm::new(Vec::new())));
        let recv_vm2: VmHandle = recv_vm.clone();
        let recv_cfg = cfg.clone();
        let standby = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let receiver = McReceiver::new(recv_vm2, sock, &recv_cfg);
            let applied = receiver.applied_counter();
            let result = receiver.run();
            (result, applied.load(Ordering::SeqCst))
        });

        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let vm = vm_handle(TestVm::new(payload.clone()));
        let shaper = RecordingShaper::default();
        let ops = shaper.ops.clone();
        let nics = vm.lock().unwrap().nics();
        let buffer = TrafficBuffer::enable(&nics, Box::new(shaper), &cfg.buffer).unwrap();
        assert_eq!(buffer.device(), "ifb7");

        let stream = TcpStream::connect(addr).unwrap();
        let handle = McLoop::new(vm, stream, Some(buffer), cfg).spawn();

        for _ in 0..1000 {
            if handle.stats().checkpoints >= 5 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        handle.cancel();
        let (state, stats) = handle.join();
        assert_eq!(state, McState::Completed);
        assert!(stats.checkpoints >= 5, "only {} checkpoints", stats.checkpoints);
        assert_eq!(
            stats.bytes_streamed,
            stats.checkpoints * (payload.len() as u64 + 4)
        );
        assert!(stats.total_downtime_ms > 0);

        // primary hung up; the standby sees the broken stream after having
        // applied every acknowledged checkpoint
        let (result, applied) = standby.join().unwrap();
        assert!(result.is_err());
        assert_eq!(applied, stats.checkpoints);

        let recv_vm = recv_vm.lock().unwrap();
        let loaded = &recv_vm.loaded;
        assert_eq!(loaded.len() as u64, stats.checkpoints);
        for state in loaded {
            assert_eq!(&state[..4], b"MCHD");
            assert_eq!(&state[4..], payload.as_slice());
        }

        // every released barrier was acknowledged first, and teardown
        // drained the qdisc
        let ops = ops.lock().unwrap();
        assert_eq!(ops[0], Op::Create);
        assert_eq!(ops[1], Op::ReleaseAll);
        let barriers = ops.iter().filter(|&op| *op == Op::Barrier).count() as u64;
        let releases = ops.iter().filter(|&op| *op == Op::ReleaseOne).count() as u64;
        assert_eq!(releases, stats.checkpoints);
        assert!(barriers >= releases);
        assert_eq!(&ops[ops.len() - 2..], &[Op::ReleaseAll, Op::Destroy]);
    }

    #[test]
    fn cancel_from_the_standby_stops_the_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let script = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            proto::write_sentinel(&mut sock, Sentinel::Ack).unwrap();
            assert_eq!(proto::read_sentinel(&mut sock).unwrap(), Sentinel::Commit);
            let size = proto::read_u32(&mut sock).unwrap() as usize;
            let mut sink = vec![0u8; size];
            sock.read_exact(&mut sink).unwrap();
            proto::write_sentinel(&mut sock, Sentinel::Cancel).unwrap();
        });

        let vm = vm_handle(TestVm::new(vec![7u8; 128]));
        let stream = TcpStream::connect(addr).unwrap();
        let handle = McLoop::new(vm, stream, None, fast_cfg()).spawn();

        let (state, stats) = handle.join();
        script.join().unwrap();
        assert_eq!(state, McState::Completed);
        assert_eq!(stats.checkpoints, 0, "a cancelled checkpoint must not count");
    }

    #[test]
    fn bad_handshake_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let script = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            proto::write_u32(&mut sock, 0x99).unwrap();
        });

        let vm = vm_handle(TestVm::new(vec![1u8; 64]));
        let stream = TcpStream::connect(addr).unwrap();
        let handle = McLoop::new(vm, stream, None, fast_cfg()).spawn();

        let (state, _) = handle.join();
        script.join().unwrap();
        assert_eq!(state, McState::Error);
    }

    #[test]
    fn receiver_accepts_cancel_as_orderly_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let standby = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            McReceiver::new(vm_handle(TestVm::new(Vec::new())), sock, &fast_cfg()).run()
        });

        let mut sock = TcpStream::connect(addr).unwrap();
        assert_eq!(proto::read_sentinel(&mut sock).unwrap(), Sentinel::Ack);
        proto::write_sentinel(&mut sock, Sentinel::Cancel).unwrap();

        assert!(standby.join().unwrap().is_ok());
    }
}
