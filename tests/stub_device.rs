//! End-to-end sessions against scripted stub instruments.
//!
//! Each stub runs as a task on one end of an in-memory duplex stream and
//! answers the CR command set the way the hardware does, including the
//! identity handshake. The crate side talks to it through the production
//! [`SerialTransport`], so framing, draining, and timing discipline are all
//! exercised for real.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use photolink::{
    Colorimeter, DeviceState, Error, InstrumentType, MeasurementSpeed, SerialTransport,
    Spectroradiometer,
};

fn spectrum_line() -> String {
    let samples: Vec<String> = (0..41).map(|i| format!("{:.4}", 0.01 * i as f64)).collect();
    format!("OK,380,780,10,{}\n", samples.join(","))
}

/// Stub CR-300 spectroradiometer. Tracks the exposure sample count.
async fn run_spectro_stub(io: DuplexStream) {
    let (reader, mut writer) = tokio::io::split(io);
    let mut lines = BufReader::new(reader).lines();
    let mut samples: u32 = 10;

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        let response = if let Some(rest) = command.strip_prefix("SM ExposureX ") {
            match rest.parse() {
                Ok(value) => {
                    samples = value;
                    "OK,0,SM ExposureX\n".to_string()
                }
                Err(_) => "ERR,3\n".to_string(),
            }
        } else if command.starts_with("SM Speed ") {
            "OK,0,SM Speed\n".to_string()
        } else {
            match command.as_str() {
                "RC InstrumentType" => "OK,0,RC InstrumentType,2\n".to_string(),
                "RC Model" => "OK,0,RC Model,CR-300\n".to_string(),
                "RC Firmware" => "OK,0,RC Firmware,\"v2.1.3\"\n".to_string(),
                "RC ID" => "OK,0,RC ID,A00612\n".to_string(),
                "RS Aperture" => "OK,0,RS Aperture,1/4 deg\n".to_string(),
                "RS ExposureX" => format!("OK,0,RS ExposureX,{samples}\n"),
                "M" => "OK,0\n".to_string(),
                "RM Spectrum" => spectrum_line(),
                "RM Exposure" => "OK,0,RM Exposure,27.2ms\n".to_string(),
                _ => "ERR,1\n".to_string(),
            }
        };
        if writer.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Stub colorimeter with filters ND1 and ND2 and a mutable wheel.
async fn run_colorimeter_stub(io: DuplexStream) {
    let (reader, mut writer) = tokio::io::split(io);
    let mut lines = BufReader::new(reader).lines();
    let mut samples: u32 = 5;
    let mut wheel: [i64; 3] = [-1, -1, -1];

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        let response = if let Some(rest) = command.strip_prefix("SM ExposureX ") {
            samples = rest.parse().unwrap_or(samples);
            "OK,0,SM ExposureX\n".to_string()
        } else if let Some(rest) = command.strip_prefix("SM Filter") {
            match rest.split_once(' ') {
                Some((position, id)) => {
                    let position: usize = position.parse().unwrap_or(0);
                    let id: i64 = id.parse().unwrap_or(-1);
                    if (1..=3).contains(&position) {
                        wheel[position - 1] = id;
                        "OK,0,SM Filter\n".to_string()
                    } else {
                        "ERR,2\n".to_string()
                    }
                }
                None => "ERR,2\n".to_string(),
            }
        } else {
            match command.as_str() {
                "RC InstrumentType" => "OK,0,RC InstrumentType,1\n".to_string(),
                "RC Model" => "OK,0,RC Model,CR-100\n".to_string(),
                "RC ID" => "OK,0,RC ID,C01311\n".to_string(),
                "RS ExposureX" => format!("OK,0,RS ExposureX,{samples}\n"),
                "RC Filter" => "OK,1,ND1,2,ND2\n".to_string(),
                "RS Filter" => {
                    let names: Vec<&str> = wheel
                        .iter()
                        .map(|id| match id {
                            1 => "ND1",
                            2 => "ND2",
                            _ => "None",
                        })
                        .collect();
                    format!("OK,{}\n", names.join(","))
                }
                "M" => "OK,0\n".to_string(),
                "RM XYZ" => "OK,102.334,100.000,87.125\n".to_string(),
                "RM Exposure" => "OK,0,RM Exposure,4.5ms\n".to_string(),
                _ => "ERR,1\n".to_string(),
            }
        };
        if writer.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn spectroradiometer_session_end_to_end() {
    let (device_side, host_side) = tokio::io::duplex(4096);
    tokio::spawn(run_spectro_stub(host_side));

    let transport = SerialTransport::from_io(Box::new(device_side), "stub0");
    let mut meter = Spectroradiometer::with_transport(Box::new(transport), MeasurementSpeed::Fast)
        .await
        .expect("handshake against the stub");

    assert_eq!(meter.device().state(), DeviceState::Ready);
    assert_eq!(meter.device().manufacturer(), "Colorimetry Research");
    assert_eq!(meter.device().firmware().await.expect("firmware"), "v2.1.3");
    assert_eq!(
        meter.device().readable_id().await.expect("id"),
        "CR-300 - A00612"
    );

    // Out-of-range request lands on the firmware limit.
    meter.device().set_average_samples(100).await.expect("set");
    assert_eq!(meter.device().average_samples().await.expect("query"), 50);

    let spectrum = meter.measure().await.expect("measure");
    assert_eq!(spectrum.samples.len(), 41);
    assert_eq!(spectrum.shape.step, 10.0);
    assert!((spectrum.exposure - 0.0272).abs() < 1e-12);
    assert_eq!(spectrum.device_id, "CR-300 - A00612");

    let wavelengths: Vec<f64> = spectrum.shape.wavelengths().collect();
    assert_eq!(wavelengths.first(), Some(&380.0));
    assert_eq!(wavelengths.last(), Some(&780.0));
}

#[tokio::test]
async fn colorimeter_session_end_to_end() {
    let (device_side, host_side) = tokio::io::duplex(4096);
    tokio::spawn(run_colorimeter_stub(host_side));

    let transport = SerialTransport::from_io(Box::new(device_side), "stub1");
    let mut meter = Colorimeter::with_transport(Box::new(transport))
        .await
        .expect("handshake against the stub");

    let filters = meter.available_filters().await.expect("filter table");
    assert_eq!(filters.len(), 3);
    assert_eq!(filters.get(&0).map(String::as_str), Some("None"));

    meter.set_current_filters(&[1, 2]).await.expect("select");
    assert_eq!(
        meter.current_filters().await.expect("read back"),
        vec![1, 2, 0]
    );

    let reading = meter.measure().await.expect("measure");
    assert_eq!(reading.xyz, [102.334, 100.0, 87.125]);
    assert!((reading.exposure - 0.0045).abs() < 1e-12);
    assert_eq!(reading.device_id, "CR-100 - C01311");
}

#[tokio::test]
async fn wrong_family_on_the_port_is_fatal() {
    let (device_side, host_side) = tokio::io::duplex(4096);
    tokio::spawn(run_colorimeter_stub(host_side));

    let transport = SerialTransport::from_io(Box::new(device_side), "stub2");
    let err = Spectroradiometer::with_transport(Box::new(transport), MeasurementSpeed::Normal)
        .await
        .expect_err("colorimeter stub cannot back a spectroradiometer");
    match err {
        Error::InstrumentTypeMismatch { expected, reported } => {
            assert_eq!(expected, InstrumentType::Spectroradiometer);
            assert_eq!(reported, InstrumentType::Colorimeter);
        }
        other => panic!("expected InstrumentTypeMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_bytes_are_drained_before_the_handshake() {
    let (device_side, mut host_side) = tokio::io::duplex(4096);

    // A response from an interrupted earlier session is still in flight.
    host_side
        .write_all(b"ERR,99\n")
        .await
        .expect("preload stale frame");
    tokio::time::sleep(Duration::from_millis(10)).await;
    tokio::spawn(run_spectro_stub(host_side));

    let transport = SerialTransport::from_io(Box::new(device_side), "stub3");
    let mut meter = Spectroradiometer::with_transport(Box::new(transport), MeasurementSpeed::Normal)
        .await
        .expect("stale frame must not poison the handshake");
    assert_eq!(meter.device().firmware().await.expect("firmware"), "v2.1.3");
}
