//! Driver behaviour against the in-memory GATT binding.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use catprint_ble::font::TextBounds;
use catprint_ble::protocol::{DATA_CHAR_UUID, WRITE_CHAR_UUID};
use catprint_ble::{
    Alignment, CatPrinter, ConnectionState, DriverConfig, Error, FailureKind, FontBook,
    PrinterEvent, Raster, TextStyle, Typeface,
};
use common::*;
use image::{Rgb, RgbImage};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

fn driver(config: DriverConfig) -> (CatPrinter<MockAdapter>, MockAdapter) {
    let adapter = MockAdapter::new();
    let printer = CatPrinter::new(adapter.clone(), config).unwrap();
    (printer, adapter)
}

async fn ready_driver() -> (CatPrinter<MockAdapter>, MockAdapter) {
    let (printer, adapter) = driver(test_config());
    printer.connect(PRINTER).await.unwrap();
    (printer, adapter)
}

fn drain(rx: &mut broadcast::Receiver<PrinterEvent>) -> Vec<PrinterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn failure_kinds(events: &[PrinterEvent]) -> Vec<FailureKind> {
    events
        .iter()
        .filter_map(|e| match e {
            PrinterEvent::Failure { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connect_reaches_ready() {
    let (printer, adapter) = driver(test_config());
    let mut rx = printer.subscribe();

    printer.connect(PRINTER).await.unwrap();

    assert_eq!(printer.state(), ConnectionState::Ready);
    assert_eq!(printer.address().as_deref(), Some(PRINTER));
    assert_eq!(adapter.state.subscriptions.load(Ordering::SeqCst), 1);
    let events = drain(&mut rx);
    assert_eq!(events.last(), Some(&PrinterEvent::Status("Printer ready".into())));
    assert!(failure_kinds(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_when_ready_is_noop() {
    let (printer, adapter) = ready_driver().await;

    printer.connect(PRINTER).await.unwrap();

    assert_eq!(printer.state(), ConnectionState::Ready);
    assert_eq!(adapter.state.opens.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.state.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_rolls_back() {
    let (printer, adapter) = driver(test_config());
    let mut rx = printer.subscribe();
    let started = tokio::time::Instant::now();

    let err = printer.connect(DEAD).await.unwrap_err();

    assert!(matches!(err, Error::ConnectTimeout(1_000)));
    assert!(started.elapsed() >= Duration::from_millis(1_000));
    assert_eq!(printer.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(failure_kinds(&drain(&mut rx)), vec![FailureKind::ConnectTimeout]);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_rolls_back() {
    let (printer, adapter) = driver(test_config());
    let mut rx = printer.subscribe();

    let err = printer.connect(NO_DATA_CHAR).await.unwrap_err();

    assert!(matches!(err, Error::Discovery(_)), "{err}");
    assert_eq!(printer.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(failure_kinds(&drain(&mut rx)), vec![FailureKind::Discovery]);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_device_fails_immediately() {
    let (printer, adapter) = driver(test_config());
    let started = tokio::time::Instant::now();

    let err = printer.connect(UNKNOWN).await.unwrap_err();

    assert!(matches!(err, Error::DeviceNotFound(_)));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(printer.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.state.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_address_rejected() {
    let (printer, adapter) = driver(test_config());
    assert!(matches!(
        printer.connect("  ").await,
        Err(Error::InvalidAddress(_))
    ));
    assert_eq!(adapter.state.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_new_connect_supersedes_pending_attempt() {
    let (printer, adapter) = driver(test_config());
    let mut rx = printer.subscribe();

    let (first, second) = tokio::join!(printer.connect(DEAD), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        printer.connect(PRINTER).await
    });

    assert!(matches!(first, Err(Error::LinkLost(_))));
    second.unwrap();
    assert_eq!(printer.state(), ConnectionState::Ready);
    assert_eq!(printer.address().as_deref(), Some(PRINTER));
    // The abandoned link was released
    assert_eq!(adapter.state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(failure_kinds(&drain(&mut rx)), vec![FailureKind::LinkLost]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_reports_failure() {
    let (printer, adapter) = driver(test_config());
    let mut rx = printer.subscribe();

    let (result, _) = tokio::join!(printer.connect(DEAD), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        printer.disconnect().await
    });

    assert!(matches!(result, Err(Error::LinkLost(_))));
    assert_eq!(printer.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(failure_kinds(&drain(&mut rx)), vec![FailureKind::LinkLost]);
}

#[tokio::test(start_paused = true)]
async fn test_print_sequence() {
    let (printer, adapter) = ready_driver().await;
    let mut rx = printer.subscribe();
    let raster = Raster::filled(384, 10, true).unwrap();

    printer.print(&raster).await.unwrap();

    let writes = adapter.state.writes();
    assert_eq!(writes.len(), 1 + 1 + 24 + 1);

    assert_eq!(writes[0].uuid, WRITE_CHAR_UUID);
    assert_eq!(
        writes[0].data,
        vec![0x22, 0x21, 0xA2, 0x00, 0x01, 0x00, 0x5D, 0x94, 0xFF]
    );
    assert_eq!(writes[1].uuid, WRITE_CHAR_UUID);
    assert_eq!(
        writes[1].data,
        vec![0x22, 0x21, 0xA9, 0x00, 0x04, 0x00, 0x0A, 0x00, 0x30, 0x00, 0x65, 0xFF]
    );
    for chunk in &writes[2..26] {
        assert_eq!(chunk.uuid, DATA_CHAR_UUID);
        assert_eq!(chunk.data, vec![0xFF; 20]);
    }
    assert_eq!(writes[26].uuid, WRITE_CHAR_UUID);
    assert_eq!(
        writes[26].data,
        vec![0x22, 0x21, 0xAD, 0x00, 0x01, 0x00, 0x00, 0x00, 0xFF]
    );

    // Pacing: 50 ms after each command, 10 ms after each chunk
    assert!(writes[1].at - writes[0].at >= Duration::from_millis(50));
    assert!(writes[2].at - writes[1].at >= Duration::from_millis(50));
    for pair in writes[2..27].windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(10));
    }

    let events = drain(&mut rx);
    assert_eq!(events.last(), Some(&PrinterEvent::Completed));
    assert_eq!(printer.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_short_final_chunk() {
    let (printer, adapter) = ready_driver().await;
    // 48 * 3 = 144 bytes: 7 full chunks and a 4-byte tail
    printer.print(&Raster::new(384, 3).unwrap()).await.unwrap();

    let writes = adapter.state.writes();
    let data: Vec<_> = writes.iter().filter(|w| w.uuid == DATA_CHAR_UUID).collect();
    assert_eq!(data.len(), 8);
    assert_eq!(data[7].data.len(), 4);
    assert!(data.iter().all(|w| w.data.iter().all(|&b| b == 0)));
}

#[tokio::test(start_paused = true)]
async fn test_print_requires_connection() {
    let (printer, adapter) = driver(test_config());
    let mut rx = printer.subscribe();

    let err = printer
        .print(&Raster::filled(384, 10, true).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotConnected));
    assert!(adapter.state.writes().is_empty());
    assert_eq!(failure_kinds(&drain(&mut rx)), vec![FailureKind::NotConnected]);
}

#[tokio::test(start_paused = true)]
async fn test_print_rejects_foreign_width() {
    let (printer, adapter) = ready_driver().await;

    let err = printer
        .print(&Raster::filled(400, 2, true).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::RasterWidth {
            width: 400,
            expected: 384
        }
    ));
    assert!(adapter.state.writes().is_empty());
    assert_eq!(printer.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_aborts_and_tears_down() {
    let (printer, adapter) = ready_driver().await;
    let mut rx = printer.subscribe();
    *adapter.state.fail_write_at.lock().unwrap() = Some(5);

    let err = printer
        .print(&Raster::filled(384, 10, true).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Write(_)));
    assert_eq!(adapter.state.writes().len(), 5);
    assert_eq!(printer.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.state.closes.load(Ordering::SeqCst), 1);
    let events = drain(&mut rx);
    assert!(!events.contains(&PrinterEvent::Completed));
    assert_eq!(failure_kinds(&events), vec![FailureKind::Print]);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_blocks_print() {
    let (printer, adapter) = ready_driver().await;

    adapter.state.drop_link("supervision timeout");
    assert_eq!(printer.state(), ConnectionState::Disconnected);

    let err = printer
        .print(&Raster::new(384, 1).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert!(adapter.state.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_mid_stream_aborts_print() {
    let (printer, adapter) = ready_driver().await;
    let mut rx = printer.subscribe();
    let raster = Raster::filled(384, 10, true).unwrap();

    // Commands take 100 ms, so the link drops while chunks are streaming
    let (result, _) = tokio::join!(printer.print(&raster), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        adapter.state.drop_link("supervision timeout");
    });

    assert!(matches!(result, Err(Error::NotConnected)));
    let writes = adapter.state.writes();
    let chunks = writes.iter().filter(|w| w.uuid == DATA_CHAR_UUID).count();
    assert!(chunks > 0 && chunks < 24, "{chunks} chunks written");
    assert!(!writes.iter().any(|w| w.uuid == WRITE_CHAR_UUID && w.data[2] == 0xAD));
    assert_eq!(printer.state(), ConnectionState::Disconnected);

    let events = drain(&mut rx);
    assert!(!events.contains(&PrinterEvent::Completed));
    assert_eq!(
        failure_kinds(&events),
        vec![FailureKind::LinkLost, FailureKind::NotConnected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_twice() {
    let (printer, adapter) = ready_driver().await;

    printer.disconnect().await.unwrap();
    printer.disconnect().await.unwrap();

    assert_eq!(printer.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_disconnect() {
    let (printer, adapter) = ready_driver().await;
    printer.disconnect().await.unwrap();

    printer.connect(PRINTER).await.unwrap();

    assert_eq!(printer.state(), ConnectionState::Ready);
    assert_eq!(adapter.state.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_drop_releases_link() {
    let (printer, adapter) = ready_driver().await;
    drop(printer);
    assert_eq!(adapter.state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callbacks_from_foreign_thread() {
    let (printer, adapter) = driver(DriverConfig::default());
    adapter.state.threaded.store(true, Ordering::SeqCst);

    printer.connect(PRINTER).await.unwrap();

    assert_eq!(printer.state(), ConnectionState::Ready);
}

/// Glyphs are solid blocks `size / 2` wide and `size` tall.
struct BlockFace;

impl Typeface for BlockFace {
    fn bounds(&self, text: &str, size: f32) -> TextBounds {
        TextBounds {
            left: 0,
            top: -(size as i32),
            right: self.advance(text, size) as i32,
            bottom: 0,
        }
    }

    fn advance(&self, text: &str, size: f32) -> f32 {
        text.chars().count() as f32 * size / 2.0
    }

    fn draw(&self, canvas: &mut RgbImage, text: &str, x: f32, baseline: f32, size: f32) {
        let right = (x + self.advance(text, size)) as u32;
        for py in (baseline - size) as u32..baseline as u32 {
            for px in x as u32..right.min(canvas.width()) {
                canvas.put_pixel(px, py, Rgb([0, 0, 0]));
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_print_text() {
    let mut fonts = FontBook::new();
    fonts.insert("block", Arc::new(BlockFace));
    let adapter = MockAdapter::new();
    let printer = CatPrinter::new(adapter.clone(), test_config())
        .unwrap()
        .with_fonts(fonts);
    printer.connect(PRINTER).await.unwrap();

    let style = TextStyle {
        family: "serif".into(),
        size: 20.0,
        alignment: Alignment::Center,
        upside_down: true,
    };
    printer.print_text("hello", &style).await.unwrap();

    let writes = adapter.state.writes();
    // 20 px text + 40 px margin = 60 rows of 48 bytes = 144 chunks
    assert_eq!(writes.len(), 1 + 1 + 144 + 1);
    assert_eq!(&writes[1].data[6..10], &[60, 0, 0x30, 0x00]);
    let ink: u32 = writes[2..146]
        .iter()
        .flat_map(|w| w.data.iter())
        .map(|b| b.count_ones())
        .sum();
    assert_eq!(ink, 50 * 20);
}

#[tokio::test(start_paused = true)]
async fn test_print_text_without_fonts() {
    let (printer, adapter) = ready_driver().await;
    let err = printer
        .print_text("hello", &TextStyle::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Font(_)));
    assert!(adapter.state.writes().is_empty());
}
