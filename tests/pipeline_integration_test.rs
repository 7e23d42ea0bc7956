//! End-to-end sessions driven by the synthetic firmware.

use breath_daq::{
    acquisition::{open_replay, FrameReader, FrameReaderConfig, MockFirmware, SyntheticBreath},
    config::{ByteOrder, SampleLayout, Settings},
    pipeline::{spawn_session, FrameReport, Pipeline, SessionEnd, SessionSummary},
};
use std::io::Cursor;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;

async fn run_stream<R>(settings: &Settings, source: R) -> (SessionSummary, Vec<FrameReport>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let pipeline = Pipeline::from_settings(settings).expect("valid settings");
    let reader = FrameReader::new(source, FrameReaderConfig::from_settings(&settings.frame));
    let (handle, stream) = spawn_session(pipeline, reader, 2);
    let reports: Vec<FrameReport> = stream.collect().await;
    let summary = handle.await.expect("session task");
    (summary, reports)
}

fn assert_near(value: f64, expected: f64, tolerance: f64) {
    assert!(
        (value - expected).abs() <= tolerance,
        "{} not within {} of {}",
        value,
        tolerance,
        expected
    );
}

#[tokio::test]
async fn test_synthetic_breathing_rate_is_recovered() {
    let settings = Settings::default();
    let breath = SyntheticBreath {
        bpm: 15.0,
        ..SyntheticBreath::default()
    };
    let recording = MockFirmware::from_settings(&settings, breath, 3)
        .with_preamble(b"boot ok\r\n".to_vec())
        .recording(2)
        .expect("recording");

    let (summary, reports) = run_stream(&settings, Cursor::new(recording)).await;

    assert_eq!(summary.end, SessionEnd::StreamClosed);
    assert_eq!(summary.frames_processed, 2);
    assert_eq!(summary.frames_dropped, 0);
    assert_eq!(reports.len(), 2);

    for report in &reports {
        for channel in [&report.channel_a, &report.channel_b] {
            // 60 s frame at 15 BPM; the rising edge at the end is not a breath.
            assert_eq!(channel.peaks.len(), 15);
            assert_near(channel.mean_interval_bpm.expect("intervals"), 15.0, 1.0);
            assert_near(channel.all_time_rate.bpm().expect("rate"), 15.0, 1.0);
            assert_near(channel.spectral.expect("spectrum").bpm, 15.0, 0.01);
            let windowed = channel.rate.bpm().expect("windowed rate");
            assert!((10.0..=16.0).contains(&windowed), "{}", windowed);
        }
        assert_eq!(report.rate(), &report.channel_a.rate);
    }
    assert_eq!(reports[0].sequence, 1);
    assert_eq!(reports[1].sequence, 2);
}

#[tokio::test]
async fn test_block_layout_big_endian() {
    let mut settings = Settings::default();
    settings.frame.samples_per_channel = 500;
    settings.frame.layout = SampleLayout::Block;
    settings.frame.byte_order = ByteOrder::Big;
    settings.rate.window_sec = 10.0;

    let breath = SyntheticBreath {
        bpm: 30.0,
        noise_v: 0.0,
        ..SyntheticBreath::default()
    };
    let recording = MockFirmware::from_settings(&settings, breath, 0)
        .recording(3)
        .expect("recording");

    let (summary, reports) = run_stream(&settings, Cursor::new(recording)).await;

    assert_eq!(summary.frames_processed, 3);
    for report in &reports {
        let a = &report.channel_a;
        assert!(a.peaks.len() >= 5);
        assert_near(a.spectral.expect("spectrum").bpm, 30.0, 0.01);
        assert!(a.peaks.indices().windows(2).all(|w| w[1] - w[0] >= 40));
    }
}

#[tokio::test]
async fn test_garbage_between_frames_is_skipped() {
    let mut settings = Settings::default();
    settings.frame.samples_per_channel = 500;
    let recording = MockFirmware::from_settings(&settings, SyntheticBreath::default(), 9)
        .with_preamble(b"\x00\xffSTAR\ndebug: adc ok\r\nST".to_vec())
        .recording(3)
        .expect("recording");

    let (summary, reports) = run_stream(&settings, Cursor::new(recording)).await;

    assert_eq!(summary.frames_processed, 3);
    assert_eq!(summary.corrupted_markers, 0);
    assert_eq!(reports.len(), 3);
}

#[tokio::test]
async fn test_truncated_recording_ends_session() {
    let mut settings = Settings::default();
    settings.frame.samples_per_channel = 500;
    let mut recording = MockFirmware::from_settings(&settings, SyntheticBreath::default(), 1)
        .recording(2)
        .expect("recording");
    recording.truncate(recording.len() - 100);

    let (summary, reports) = run_stream(&settings, Cursor::new(recording)).await;

    assert_eq!(summary.end, SessionEnd::StreamClosed);
    assert_eq!(summary.frames_processed, 1);
    assert_eq!(reports.len(), 1);
}

#[tokio::test]
async fn test_frame_limit() {
    let mut settings = Settings::default();
    settings.frame.samples_per_channel = 500;
    settings.session.max_frames = Some(2);
    let recording = MockFirmware::from_settings(&settings, SyntheticBreath::default(), 1)
        .recording(5)
        .expect("recording");

    let (summary, reports) = run_stream(&settings, Cursor::new(recording)).await;

    assert_eq!(summary.end, SessionEnd::Completed);
    assert_eq!(reports.len(), 2);
}

#[tokio::test]
async fn test_replay_from_file() {
    let mut settings = Settings::default();
    settings.frame.samples_per_channel = 500;
    let recording = MockFirmware::from_settings(&settings, SyntheticBreath::default(), 5)
        .recording(2)
        .expect("recording");
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), &recording).expect("write recording");

    let source = open_replay(file.path()).await.expect("open replay");
    let (summary, reports) = run_stream(&settings, source).await;

    assert_eq!(summary.end, SessionEnd::StreamClosed);
    assert_eq!(reports.len(), 2);
}
