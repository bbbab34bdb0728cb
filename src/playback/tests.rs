use super::*;
use crate::{codec::PcmDecoder, samples_to_bytes};
use std::time::Duration;

fn packet(samples: usize, value: i16) -> Vec<u8> {
    samples_to_bytes(&vec![value; samples])
}

fn start(output: Arc<VirtualOutput>) -> (StreamingAudioContext, tokio::task::JoinHandle<()>) {
    let ctx = StreamingAudioContext::new(PlaybackOption::default(), output);
    let runner = ctx.clone();
    let handle = tokio::spawn(async move { runner.run(Box::new(PcmDecoder)).await });
    (ctx, handle)
}

fn assert_sequential(buffers: &[ScheduledBuffer]) {
    for pair in buffers.windows(2) {
        assert!(pair[1].start >= pair[0].start, "start times must not decrease");
        assert!(
            pair[1].start >= pair[0].end(),
            "buffer at {} overlaps the one ending at {}",
            pair[1].start,
            pair[0].end()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_irregular_arrivals_play_in_order_without_overlap() {
    let output = Arc::new(VirtualOutput::new(16000));
    let (ctx, handle) = start(output.clone());

    let arrivals: [(usize, u64); 10] = [
        (960, 0),
        (320, 5),
        (1600, 0),
        (960, 140),
        (480, 10),
        (960, 0),
        (960, 0),
        (160, 400),
        (960, 30),
        (1920, 0),
    ];
    let mut total = 0;
    for (i, (samples, gap_ms)) in arrivals.iter().enumerate() {
        tokio::time::sleep(Duration::from_millis(*gap_ms)).await;
        ctx.push_packet(packet(*samples, i as i16 + 1)).await.unwrap();
        total += samples;
    }
    ctx.end_of_stream();
    handle.await.unwrap();

    let buffers = output.buffers();
    assert!(!buffers.is_empty());
    assert_sequential(&buffers);
    let scheduled: usize = buffers.iter().map(|b| b.samples.len()).sum();
    assert_eq!(scheduled, total);
    assert_eq!(ctx.scheduled_end(), buffers.last().unwrap().end());

    // Packet order survives batching.
    let rendered: Vec<i16> = buffers.iter().flat_map(|b| b.samples.clone()).collect();
    let mut markers = rendered.clone();
    markers.dedup();
    assert_eq!(markers, (1..=10).collect::<Vec<i16>>());
}

#[tokio::test(start_paused = true)]
async fn test_sparse_input_is_flushed_before_min_duration() {
    let output = Arc::new(VirtualOutput::new(16000));
    let (ctx, handle) = start(output.clone());

    ctx.push_packet(packet(320, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let buffers = output.buffers();
    assert_eq!(buffers.len(), 1, "a lone 20ms packet must not starve");
    assert_eq!(buffers[0].samples.len(), 320);

    ctx.end_of_stream();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_clears_queues_and_resets_schedule() {
    let output = Arc::new(VirtualOutput::new(16000));
    let (ctx, handle) = start(output.clone());

    for _ in 0..50 {
        ctx.push_packet(packet(960, 1)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctx.scheduled_end() > output.now());

    ctx.stop();
    let stopped_at = output.now();
    assert_eq!(ctx.scheduled_end(), 0);
    assert_eq!(ctx.queued(), (0, 0));
    assert!(output.buffers().iter().all(|b| b.end() <= stopped_at));
    let kept = output.buffers().len();

    for _ in 0..4 {
        ctx.push_packet(packet(960, 2)).await.unwrap();
    }
    ctx.end_of_stream();
    handle.await.unwrap();

    let buffers = output.buffers();
    assert_sequential(&buffers);
    let fresh = &buffers[kept..];
    assert!(fresh.iter().all(|b| b.start >= stopped_at));
    assert!(fresh.iter().all(|b| b.samples.iter().all(|s| *s == 2)));
    let fresh_samples: usize = fresh.iter().map(|b| b.samples.len()).sum();
    assert_eq!(fresh_samples, 4 * 960);
}

#[tokio::test]
async fn test_push_after_end_of_stream_fails() {
    let output = Arc::new(VirtualOutput::new(16000));
    let ctx = StreamingAudioContext::new(PlaybackOption::default(), output);
    ctx.end_of_stream();
    assert!(ctx.push_packet(packet(10, 1)).await.is_err());
}
