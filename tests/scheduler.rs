// Scheduler behaviour over a scripted transport: wire-level priority
// ordering, rejection of unknown functions, and clean lifecycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mbclient::transport::ClientPort;
use mbclient::{
    DeviceConfig, Error, Format, ItemConfig, MemoryType, Payload, PortConfig, ProjectConfig,
    Request, Runtime, Status, TransportConfig,
};

/// Transport double: every transaction takes `delay` of wall time, during
/// which all calls return Processing. Completions are appended to a
/// shared log as "function:offset".
struct SlowPort {
    delay: Duration,
    current: Option<(String, Instant)>,
    log: Arc<Mutex<Vec<String>>>,
}

impl SlowPort {
    fn new(log: Arc<Mutex<Vec<String>>>, delay: Duration) -> Self {
        SlowPort {
            delay,
            current: None,
            log,
        }
    }

    fn drive(&mut self, key: String) -> Status {
        match &self.current {
            Some((active, started)) if *active == key => {
                if started.elapsed() >= self.delay {
                    self.current = None;
                    self.log.lock().unwrap().push(key);
                    Status::Good
                } else {
                    Status::Processing
                }
            }
            // half-duplex: other transactions wait for the line
            Some(_) => Status::Processing,
            None => {
                self.current = Some((key, Instant::now()));
                Status::Processing
            }
        }
    }
}

impl ClientPort for SlowPort {
    fn read_coils(&mut self, _unit: u8, offset: u16, count: u16, out: &mut [bool]) -> Status {
        out.fill(false);
        self.drive(format!("read_coils:{offset}:{count}"))
    }
    fn read_discrete_inputs(
        &mut self,
        _unit: u8,
        offset: u16,
        count: u16,
        _out: &mut [bool],
    ) -> Status {
        self.drive(format!("read_discrete_inputs:{offset}:{count}"))
    }
    fn read_input_registers(
        &mut self,
        _unit: u8,
        offset: u16,
        count: u16,
        _out: &mut [u16],
    ) -> Status {
        self.drive(format!("read_input_registers:{offset}:{count}"))
    }
    fn read_holding_registers(
        &mut self,
        _unit: u8,
        offset: u16,
        count: u16,
        out: &mut [u16],
    ) -> Status {
        out.fill(0x1234);
        self.drive(format!("read_holding_registers:{offset}:{count}"))
    }
    fn read_exception_status(&mut self, _unit: u8, out: &mut u8) -> Status {
        *out = 0;
        self.drive("read_exception_status:0:1".to_string())
    }
    fn write_single_coil(&mut self, _unit: u8, offset: u16, _value: bool) -> Status {
        self.drive(format!("write_single_coil:{offset}:1"))
    }
    fn write_single_register(&mut self, _unit: u8, offset: u16, _value: u16) -> Status {
        self.drive(format!("write_single_register:{offset}:1"))
    }
    fn write_multiple_coils(&mut self, _unit: u8, offset: u16, values: &[bool]) -> Status {
        self.drive(format!("write_multiple_coils:{offset}:{}", values.len()))
    }
    fn write_multiple_registers(&mut self, _unit: u8, offset: u16, values: &[u16]) -> Status {
        self.drive(format!("write_multiple_registers:{offset}:{}", values.len()))
    }
    fn last_error_text(&self) -> String {
        "scripted".to_string()
    }
}

fn project() -> ProjectConfig {
    ProjectConfig {
        ports: vec![PortConfig {
            name: "scripted".to_string(),
            transport: TransportConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 1502,
                timeout_ms: 1000,
            },
            devices: vec![DeviceConfig {
                name: "plc".to_string(),
                unit: 1,
                max_read_coils: 2000,
                max_read_discrete_inputs: 2000,
                max_read_input_registers: 125,
                max_read_holding_registers: 125,
                max_write_multiple_coils: 1968,
                max_write_multiple_registers: 123,
                byte_order: None,
                register_order: None,
                byte_array_format: None,
                byte_array_separator: None,
                string_length_type: None,
                string_encoding: None,
                items: vec![ItemConfig {
                    name: "level".to_string(),
                    mem: MemoryType::HoldingRegisters,
                    offset: 10,
                    format: Format::UDec16,
                    byte_length: None,
                    period_ms: 0,
                    byte_order: None,
                    register_order: None,
                    byte_array_format: None,
                    byte_array_separator: None,
                    string_length_type: None,
                    string_encoding: None,
                }],
            }],
        }],
    }
}

fn start_scripted(
    runtime: &mut Runtime,
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
) -> Result<(), Error> {
    runtime.start_with(move |_, _| {
        Ok(Box::new(SlowPort::new(log.clone(), delay)) as Box<dyn ClientPort>)
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_external_preempts_queued_write_on_the_wire() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = Runtime::from_config(project()).unwrap();
    let device = runtime.device_by_name("plc").unwrap();
    let item = runtime.item_by_name("level").unwrap();

    start_scripted(&mut runtime, log.clone(), Duration::from_millis(15)).unwrap();
    // let the read rotation occupy the wire
    tokio::time::sleep(Duration::from_millis(20)).await;

    // user writes first, then injects an ad-hoc read; the ad-hoc message
    // must still hit the wire first
    runtime.write_item_data(item, &[0x2A, 0x00]).unwrap();
    let handle = runtime
        .send_message(device, Request::read_coils(7, 3))
        .unwrap();
    let result = handle.wait().await;
    assert_eq!(result.status, Status::Good);
    assert_eq!(result.payload, Payload::Bits(vec![false, false, false]));

    // give the write time to complete, then check the wire order
    tokio::time::sleep(Duration::from_millis(60)).await;
    runtime.stop().await;

    let calls = log.lock().unwrap().clone();
    let coils_at = calls
        .iter()
        .position(|c| c == "read_coils:7:3")
        .expect("external read must reach the wire");
    let write_at = calls
        .iter()
        .position(|c| c == "write_multiple_registers:10:1")
        .expect("queued write must reach the wire");
    assert!(
        coils_at < write_at,
        "external must precede the queued write: {calls:?}"
    );
    assert!(
        calls[write_at + 1..]
            .iter()
            .any(|c| c == "read_holding_registers:10:1"),
        "reads must resume after the write: {calls:?}"
    );
    assert_eq!(
        calls
            .iter()
            .filter(|c| c.starts_with("write_multiple_registers"))
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_function_never_reaches_the_wire() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = Runtime::from_config(project()).unwrap();
    let device = runtime.device_by_name("plc").unwrap();

    start_scripted(&mut runtime, log.clone(), Duration::from_millis(1)).unwrap();
    let handle = runtime
        .send_message(
            device,
            Request {
                function: 99,
                offset: 0,
                count: 1,
                payload: Payload::None,
            },
        )
        .unwrap();
    let result = handle.wait().await;
    assert_eq!(result.status, Status::Bad);

    tokio::time::sleep(Duration::from_millis(20)).await;
    runtime.stop().await;
    let calls = log.lock().unwrap().clone();
    assert!(
        calls.iter().all(|c| c.starts_with("read_holding_registers")),
        "only the periodic read may touch the wire: {calls:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribers_hear_periodic_reads() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = Runtime::from_config(project()).unwrap();
    let item = runtime.item_by_name("level").unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    runtime
        .subscribe(item, move |update| {
            sink.lock()
                .unwrap()
                .push((update.bytes.clone(), update.status));
        })
        .unwrap();

    start_scripted(&mut runtime, log, Duration::from_millis(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    runtime.stop().await;

    let seen = updates.lock().unwrap().clone();
    assert!(seen.len() >= 2, "expected repeated updates, got {seen:?}");
    for (bytes, status) in &seen {
        assert_eq!(*status, Status::Good);
        // canonical little-endian copy of register 0x1234
        assert_eq!(bytes, &vec![0x34, 0x12]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_devices_share_the_port_round_robin() {
    // two devices on one port, both polling continuously: neither may
    // starve the other
    let mut config = project();
    let mut second = config.ports[0].devices[0].clone();
    second.name = "plc2".to_string();
    second.unit = 2;
    second.items[0].name = "level2".to_string();
    second.items[0].offset = 40;
    config.ports[0].devices.push(second);

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = Runtime::from_config(config).unwrap();
    start_scripted(&mut runtime, log.clone(), Duration::from_millis(5)).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    runtime.stop().await;

    let calls = log.lock().unwrap().clone();
    let first = calls
        .iter()
        .filter(|c| *c == "read_holding_registers:10:1")
        .count();
    let second = calls
        .iter()
        .filter(|c| *c == "read_holding_registers:40:1")
        .count();
    assert!(first >= 3, "device 1 made {first} reads: {calls:?}");
    assert!(second >= 3, "device 2 made {second} reads: {calls:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_aborts_queued_messages() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut runtime = Runtime::from_config(project()).unwrap();
    let device = runtime.device_by_name("plc").unwrap();

    // transactions take much longer than the gap before stop(), so the
    // queued externals are still pending when shutdown is signalled
    start_scripted(&mut runtime, log, Duration::from_millis(300)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let first = runtime
        .send_message(device, Request::read_holding_registers(0, 1))
        .unwrap();
    let second = runtime
        .send_message(device, Request::read_holding_registers(1, 1))
        .unwrap();
    runtime.stop().await;

    assert_eq!(first.wait().await.status, Status::BadAborted);
    assert_eq!(second.wait().await.status, Status::BadAborted);
    assert!(!runtime.is_running());
}
