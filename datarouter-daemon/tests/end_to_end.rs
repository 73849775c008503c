// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Full pipeline: a producer process writes records into shared memory,
//! announces itself over the control socket, the daemon performs the
//! acquisition handshake, drains the queue and forwards DLT frames over UDP.

use datarouter_daemon::config::{ChannelDescription, StaticConfig, ThroughputQuotas};
use datarouter_daemon::dlt_log_server::DltLogServer;
use datarouter_daemon::forwarder::Forwarder;
use datarouter_daemon::persistence::InMemoryDictionary;
use datarouter_daemon::record::{LogEntry, LOG_ENTRY_TYPE};
use datarouter_daemon::sessions::session_factory;
use datarouter_daemon::unix_domain::{UnixDomainClient, UnixDomainServer};
use datarouter_dlt::{DltId, LogLevel, STANDARD_HEADER_BYTES, VERBOSE_HEADER_BYTES};
use datarouter_queue::messages::{
    decode_connect, encode_acquire_response, encode_connect, MessageId, ReadAcquireResult,
};
use datarouter_queue::SharedMemoryWriter;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn unique_shm_name(tag: &str) -> CString {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    CString::new(format!(
        "/datarouter-e2e-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
    .unwrap()
}

fn single_channel_config(dst_port: u16) -> StaticConfig {
    let mut channels = BTreeMap::new();
    channels.insert(
        "DFLT".to_string(),
        ChannelDescription {
            ecu: DltId::new("ECU1"),
            address: "127.0.0.1".into(),
            port: 0,
            dst_address: "127.0.0.1".into(),
            dst_port,
            channel_threshold: LogLevel::Verbose,
            multicast_interface: String::new(),
        },
    );
    StaticConfig {
        channels,
        channel_assignments: Default::default(),
        message_thresholds: Default::default(),
        filtering_enabled: true,
        default_channel: DltId::new("DFLT"),
        coredump_channel: None,
        default_threshold: LogLevel::Verbose,
        throughput: ThroughputQuotas::default(),
    }
}

#[test]
fn producer_records_arrive_as_dlt_frames() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let dst_port = receiver.local_addr().unwrap().port();

    let server = Arc::new(DltLogServer::new(
        single_channel_config(dst_port),
        Box::new(InMemoryDictionary::default()),
    ));
    let forwarder = Arc::new(Forwarder::spawn(Arc::clone(&server)));

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("control.sock");
    let mut control = UnixDomainServer::bind(
        &socket_path,
        session_factory(Arc::clone(&server), Arc::clone(&forwarder)),
    )
    .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let control_thread = std::thread::spawn(move || control.run(&stop_flag));

    // Producer side: records go into shared memory before the daemon knows
    // about the producer at all.
    let shm_name = unique_shm_name("pipeline");
    let writer = SharedMemoryWriter::create(&shm_name, 64 * 1024).unwrap();
    assert!(writer.register_type(LOG_ENTRY_TYPE, b"LogEntry"));
    let entry = LogEntry {
        app_id: DltId::new("APP0"),
        ctx_id: DltId::new("CTX0"),
        log_level: LogLevel::Info,
        num_of_args: 1,
        payload: b"hello over dlt",
    };
    assert!(writer.write_record(LOG_ENTRY_TYPE, 1_000_000, &entry.encode()));

    // Announce over the control socket and answer the daemon's acquisition
    // request the way the producer-side message client would.
    let mut client = UnixDomainClient::connect(&socket_path).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let announce = encode_connect(shm_name.to_str().unwrap());
    assert!(decode_connect(&announce).is_some());
    client.send(&announce).unwrap();

    let request = client.recv().unwrap();
    assert_eq!(request, [MessageId::AcquireRequest as u8]);
    client
        .send(&encode_acquire_response(ReadAcquireResult {
            acquired_buffer: writer.current_switch_count(),
        }))
        .unwrap();

    // The forwarder drains the handed-over block and sends one DLT frame.
    let mut buf = [0u8; 2048];
    let received = receiver.recv(&mut buf).unwrap();
    let frame = &buf[..received];

    assert_eq!(received, VERBOSE_HEADER_BYTES + entry.payload.len());
    assert_eq!(frame[0], 0x35); // WEID | WTMS | VERS | UEH
    let length = u16::from_be_bytes([frame[2], frame[3]]);
    assert_eq!(length as usize, received);
    let extended = &frame[STANDARD_HEADER_BYTES + 8..];
    assert_eq!(&extended[2..6], b"APP0");
    assert_eq!(&extended[6..10], b"CTX0");
    assert_eq!(&frame[VERBOSE_HEADER_BYTES..], entry.payload);

    // Records written after the handshake flow through the periodic sweep.
    let second = LogEntry {
        payload: b"second",
        ..entry
    };
    assert!(writer.write_record(LOG_ENTRY_TYPE, 2_000_000, &second.encode()));
    let mut buf = [0u8; 2048];
    let received = receiver.recv(&mut buf).unwrap();
    assert_eq!(received, VERBOSE_HEADER_BYTES + second.payload.len());

    stop.store(true, Ordering::SeqCst);
    control_thread.join().unwrap();
    forwarder.shutdown();
}

#[test]
fn detached_producer_residue_is_flushed() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let dst_port = receiver.local_addr().unwrap().port();

    let server = Arc::new(DltLogServer::new(
        single_channel_config(dst_port),
        Box::new(InMemoryDictionary::default()),
    ));
    let forwarder = Arc::new(Forwarder::spawn(Arc::clone(&server)));

    let shm_name = unique_shm_name("detach");
    let writer = SharedMemoryWriter::create(&shm_name, 64 * 1024).unwrap();
    let entry = LogEntry {
        app_id: DltId::new("APP0"),
        ctx_id: DltId::new("CTX0"),
        log_level: LogLevel::Warn,
        num_of_args: 0,
        payload: b"last words",
    };
    assert!(writer.write_record(LOG_ENTRY_TYPE, 500_000, &entry.encode()));

    // Hand the mapping straight to the forwarder, then detach the producer.
    let reader = datarouter_queue::SharedMemoryReader::open(&shm_name).unwrap();
    forwarder.attach(Box::new(reader));
    writer.detach();

    let mut frame = [0u8; 2048];
    let received = receiver.recv(&mut frame).unwrap();
    assert_eq!(received, VERBOSE_HEADER_BYTES + entry.payload.len());
    assert_eq!(&frame[VERBOSE_HEADER_BYTES..received], entry.payload);

    forwarder.shutdown();
    let _ = nix_unlink(&shm_name);
}

fn nix_unlink(name: &CString) -> std::io::Result<()> {
    let mut reader = datarouter_queue::SharedMemoryReader::open(name)?;
    reader.unlink();
    Ok(())
}
