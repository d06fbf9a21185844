//! Streaming engine sessions against a simulated output device

mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{fake_output, ramp, FakeLoader, FakeSpec, FakeStats};
use plugchain::audio::output::samples_duration;
use plugchain::audio::{
    capture_queue, AudioError, EngineConfig, FileSource, MemorySource, SampleSource, SourceSpec,
    StreamEngine, StreamState,
};

const RATE: u32 = 44100;
const BLOCK: usize = 256;

fn config() -> EngineConfig {
    EngineConfig {
        block_size: BLOCK,
        sample_rate: RATE,
        buffer_ceiling: Duration::from_millis(50),
        pause_poll: Duration::from_millis(5),
        backpressure_poll: Duration::from_millis(2),
        empty_read_retry: Duration::from_millis(2),
        ..EngineConfig::default()
    }
}

fn memory(samples: Vec<f32>, channels: usize) -> SourceSpec {
    SourceSpec::Stream(Box::new(MemorySource::new(samples, channels, RATE).unwrap()))
}

/// Poll `condition` until it holds or `timeout` passes
fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Given an empty chain, a finite source plays out unchanged
/// and the session ends on its own
#[test]
fn test_finite_source_plays_to_end() {
    let mut engine = StreamEngine::new(FakeLoader::new(), config()).unwrap();
    let input = ramp(4096, 2);
    let (factory, record) = fake_output(None, 20.0);

    engine.play(memory(input.clone(), 2), factory).unwrap();
    engine.wait().unwrap();

    assert_eq!(engine.state(), StreamState::Stopped);
    assert!(engine.current_node().is_none());
    let record = record.lock();
    assert_eq!(record.channels, 2);
    assert_eq!(record.sample_rate, RATE);
    assert_eq!(record.samples, input);
    assert!(record.stopped);
}

/// The output buffer never holds more than the ceiling plus one block
#[test]
fn test_backpressure_bounds_buffered_audio() {
    let cfg = EngineConfig {
        buffer_ceiling: Duration::from_millis(300),
        ..config()
    };
    let ceiling = cfg.buffer_ceiling;
    let mut engine = StreamEngine::new(FakeLoader::new(), cfg).unwrap();
    let frames = RATE as usize * 6 / 10;
    let (factory, record) = fake_output(None, 1.0);

    engine.play(memory(vec![0.1; frames * 2], 2), factory).unwrap();
    engine.wait().unwrap();

    let record = record.lock();
    let bound = ceiling + samples_duration(BLOCK * 2, 2, RATE) + Duration::from_millis(1);
    assert!(
        record.max_buffered <= bound,
        "buffered {:?} exceeds {:?}",
        record.max_buffered,
        bound
    );
    assert_eq!(record.samples.len(), frames * 2);
}

/// The node is pinned to whatever channel count the output accepts
#[test]
fn test_output_channel_count_is_pinned() {
    let loader = FakeLoader::new();
    let path = loader.register("mono", FakeSpec::identity(1, 1));
    let mut engine = StreamEngine::new(loader, config()).unwrap();
    engine.add_plugin(&path).unwrap();
    let (factory, record) = fake_output(Some(2), 50.0);

    engine.play(memory(vec![0.3; 1024], 1), factory).unwrap();
    assert_eq!(engine.current_node().map(|n| n.channels()), Some(2));
    engine.wait().unwrap();

    let record = record.lock();
    assert_eq!(record.samples.len(), 2048);
    assert!(record.samples.iter().all(|&s| s == 0.3));
}

/// Idle -> Running -> Paused -> Running -> Stopped, with invalid
/// transitions rejected
#[test]
fn test_state_transitions() {
    let mut engine = StreamEngine::new(FakeLoader::new(), config()).unwrap();
    assert_eq!(engine.state(), StreamState::Idle);
    assert!(matches!(engine.pause(), Err(AudioError::InvalidOperation(_))));

    let paused = engine.pause_flag();
    let (_sink, source) = capture_queue(2, RATE, 1024, engine.pause_flag()).unwrap();
    let (factory, _record) = fake_output(None, 1.0);
    engine
        .play(SourceSpec::Stream(Box::new(source)), factory)
        .unwrap();
    assert_eq!(engine.state(), StreamState::Running);

    let (again, _) = fake_output(None, 1.0);
    assert!(matches!(
        engine.play(memory(vec![0.0; 64], 2), again),
        Err(AudioError::InvalidOperation(_))
    ));

    engine.pause().unwrap();
    engine.pause().unwrap();
    assert_eq!(engine.state(), StreamState::Paused);
    assert!(paused.load(Ordering::SeqCst));

    engine.resume().unwrap();
    engine.resume().unwrap();
    assert_eq!(engine.state(), StreamState::Running);

    engine.stop().unwrap();
    assert_eq!(engine.state(), StreamState::Stopped);
    assert!(matches!(engine.resume(), Err(AudioError::InvalidOperation(_))));

    // A stopped engine can start a new session
    let (factory, _record) = fake_output(None, 50.0);
    engine.play(memory(vec![0.0; 512], 2), factory).unwrap();
    engine.wait().unwrap();
    assert_eq!(engine.state(), StreamState::Stopped);
}

/// Live samples arriving while paused are dropped, not queued
#[test]
fn test_live_samples_dropped_while_paused() {
    let mut engine = StreamEngine::new(FakeLoader::new(), config()).unwrap();
    let (mut sink, source) = capture_queue(2, RATE, 8192, engine.pause_flag()).unwrap();
    let (factory, record) = fake_output(None, 50.0);
    engine
        .play(SourceSpec::Stream(Box::new(source)), factory)
        .unwrap();

    assert_eq!(sink.push(&vec![0.5; 512 * 2]), 1024);
    assert!(wait_for(Duration::from_secs(2), || record.lock().samples.len() == 1024));

    engine.pause().unwrap();
    assert_eq!(sink.push(&vec![0.9; 512 * 2]), 0);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(record.lock().samples.len(), 1024);

    engine.resume().unwrap();
    assert_eq!(sink.push(&vec![0.25; 256 * 2]), 512);
    assert!(wait_for(Duration::from_secs(2), || record.lock().samples.len() == 1536));

    engine.stop().unwrap();
    let record = record.lock();
    assert!(record.samples.iter().all(|&s| s != 0.9));
    assert!(record.pause_calls >= 1);
}

/// Removing a plugin mid-stream swaps in a node without it before the
/// plugin is unloaded
#[test]
fn test_remove_plugin_while_streaming() {
    let loader = FakeLoader::new();
    let path = loader.register("half", FakeSpec::gain(2, 0.5));
    let mut engine = StreamEngine::new(loader.clone(), config()).unwrap();
    engine.add_plugin(&path).unwrap();

    let (mut sink, source) = capture_queue(2, RATE, 8192, engine.pause_flag()).unwrap();
    let (factory, record) = fake_output(None, 50.0);
    engine
        .play(SourceSpec::Stream(Box::new(source)), factory)
        .unwrap();
    assert_eq!(engine.current_node().map(|n| n.stage_ids().len()), Some(1));

    sink.push(&vec![1.0; BLOCK * 2]);
    assert!(wait_for(Duration::from_secs(2), || record.lock().samples.len() == BLOCK * 2));
    assert!(record.lock().samples.iter().all(|&s| s == 0.5));

    assert!(matches!(
        engine.remove_plugin(4),
        Err(AudioError::InvalidArgument(_))
    ));
    engine.remove_plugin(0).unwrap();
    assert_eq!(FakeStats::get(&loader.stats.unloads), 1);
    assert!(engine.plugins().is_empty());
    assert_eq!(engine.current_node().map(|n| n.stage_ids().len()), Some(0));

    sink.push(&vec![1.0; BLOCK * 2]);
    assert!(wait_for(Duration::from_secs(2), || record.lock().samples.len() == BLOCK * 4));
    assert!(record.lock().samples[BLOCK * 2..].iter().all(|&s| s == 1.0));

    engine.stop().unwrap();
    assert_eq!(FakeStats::get(&loader.stats.unloads), 1);
}

/// Adding and moving plugins mid-stream re-chains the running node
#[test]
fn test_chain_edits_while_streaming() {
    let loader = FakeLoader::new();
    let a = loader.register("a", FakeSpec::gain(2, 0.5));
    let b = loader.register("b", FakeSpec::gain(2, 0.5));
    let mut engine = StreamEngine::new(loader.clone(), config()).unwrap();

    let (_sink, source) = capture_queue(2, RATE, 4096, engine.pause_flag()).unwrap();
    let (factory, _record) = fake_output(None, 50.0);
    engine
        .play(SourceSpec::Stream(Box::new(source)), factory)
        .unwrap();

    let first = engine.add_plugin(&a).unwrap();
    let second = engine.add_plugin(&b).unwrap();
    assert_eq!(
        engine.current_node().unwrap().stage_ids(),
        vec![first.id(), second.id()]
    );

    assert!(engine.move_plugin(1, 0).unwrap());
    assert!(!engine.move_plugin(5, 0).unwrap());
    assert_eq!(
        engine.current_node().unwrap().stage_ids(),
        vec![second.id(), first.id()]
    );

    engine.shutdown().unwrap();
    assert_eq!(FakeStats::get(&loader.stats.unloads), 2);
}

/// A plugin that cannot start while streaming is not left in the chain
#[test]
fn test_failed_add_while_streaming_keeps_chain() {
    let loader = FakeLoader::new();
    let ok = loader.register("ok", FakeSpec::gain(2, 0.5));
    let stuck = loader.register(
        "stuck",
        FakeSpec {
            fail_start: true,
            ..FakeSpec::identity(2, 2)
        },
    );
    let mut engine = StreamEngine::new(loader.clone(), config()).unwrap();

    let (_sink, source) = capture_queue(2, RATE, 4096, engine.pause_flag()).unwrap();
    let (factory, _record) = fake_output(None, 50.0);
    engine
        .play(SourceSpec::Stream(Box::new(source)), factory)
        .unwrap();

    let first = engine.add_plugin(&ok).unwrap();
    assert!(engine.add_plugin(&stuck).is_err());
    assert_eq!(engine.plugins().len(), 1);
    assert_eq!(FakeStats::get(&loader.stats.unloads), 1);
    assert_eq!(engine.current_node().unwrap().stage_ids(), vec![first.id()]);

    // Later edits still re-chain
    engine.refresh().unwrap();
    assert!(!engine.move_plugin(0, 1).unwrap());

    engine.shutdown().unwrap();
    assert_eq!(FakeStats::get(&loader.stats.unloads), 2);
}

/// Given a session that failed on the output device without anyone
/// waiting on it, the next play starts normally
#[test]
fn test_play_after_failed_session() {
    let mut engine = StreamEngine::new(FakeLoader::new(), config()).unwrap();
    let (factory, record) = fake_output(None, 50.0);
    record.lock().fail_after = Some(2);

    engine.play(memory(ramp(8192, 2), 2), factory).unwrap();
    assert!(wait_for(Duration::from_secs(2), || engine.is_finished()));
    assert!(wait_for(Duration::from_secs(1), || {
        engine.state() == StreamState::Stopped
    }));
    assert_eq!(record.lock().enqueue_calls, 2);

    let input = ramp(1024, 2);
    let (factory, record) = fake_output(None, 50.0);
    engine.play(memory(input.clone(), 2), factory).unwrap();
    engine.wait().unwrap();
    assert_eq!(record.lock().samples, input);
}

/// An unknown extension fails the session before anything plays
#[test]
fn test_unsupported_file_format() {
    let mut engine = StreamEngine::new(FakeLoader::new(), config()).unwrap();
    let (factory, record) = fake_output(None, 1.0);

    let result = engine.play(SourceSpec::File(PathBuf::from("clip.xyz")), factory);

    assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));
    assert_eq!(engine.state(), StreamState::Stopped);
    assert_eq!(record.lock().enqueue_calls, 0);
}

fn write_wav(name: &str, samples: &[f32], channels: u16) -> PathBuf {
    let path = std::env::temp_dir().join(format!("plugchain-{}-{}.wav", name, std::process::id()));
    let spec = hound::WavSpec {
        channels,
        sample_rate: RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &sample in samples {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// A float WAV decodes to the samples that were written
#[test]
fn test_decode_wav_file() {
    let input = ramp(3000, 2);
    let path = write_wav("decode", &input, 2);

    let mut source = FileSource::open(&path).unwrap();
    assert_eq!(source.channels(), 2);
    assert_eq!(source.sample_rate(), RATE);

    let mut decoded = Vec::new();
    let mut buf = vec![0.0f32; 1000];
    loop {
        let frames = source.read(&mut buf);
        if frames == 0 {
            break;
        }
        decoded.extend_from_slice(&buf[..frames * 2]);
    }
    assert_eq!(decoded.len(), input.len());
    for (a, b) in decoded.iter().zip(&input) {
        assert!((a - b).abs() < 1e-6);
    }

    let _ = std::fs::remove_file(path);
}

/// A WAV file streams through a plugin to the output
#[test]
fn test_play_wav_file_through_plugin() {
    let input = vec![0.4f32; 2000 * 2];
    let path = write_wav("play", &input, 2);
    let loader = FakeLoader::new();
    let half = loader.register("half", FakeSpec::gain(2, 0.5));
    let mut engine = StreamEngine::new(loader.clone(), config()).unwrap();
    engine.add_plugin(&half).unwrap();
    let (factory, record) = fake_output(None, 50.0);

    engine.play(SourceSpec::File(path.clone()), factory).unwrap();
    engine.wait().unwrap();

    let record = record.lock();
    assert_eq!(record.samples.len(), input.len());
    assert!(record.samples.iter().all(|s| (s - 0.2).abs() < 1e-6));
    // 2000 frames at 256 per block: the tail block is zero-padded
    assert_eq!(FakeStats::get(&loader.stats.process_calls), 8);

    let _ = std::fs::remove_file(path);
}
