use anyhow::{Result, anyhow};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, info, warn};
use voxgate::{
    FRAME_SAMPLES, SAMPLE_RATE,
    codec::PcmDecoder,
    playback::{PlaybackOption, StreamingAudioContext, VirtualOutput},
    protocol::{ServerFrame, ServerMessage, TtsState},
    samples_to_bytes,
};

/// Talk to a voxgate server from the command line.
///
/// ```bash
/// voxgate-client --input question_16k.wav --output reply.wav
/// voxgate-client --text "what's the weather in Paris"
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "ws://127.0.0.1:8000/voxgate/v1/")]
    url: String,

    /// 16 kHz mono 16-bit WAV streamed as microphone audio
    #[arg(short, long)]
    input: Option<String>,

    /// Typed text sent instead of audio
    #[arg(short, long)]
    text: Option<String>,

    /// Where the scheduled playback timeline is written
    #[arg(short, long, default_value = "reply.wav")]
    output: String,

    #[arg(long, default_value = "voxgate-client")]
    device_id: String,

    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    timeout: u64,
}

fn read_wav(path: &str) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE || spec.channels != 1 || spec.bits_per_sample != 16 {
        return Err(anyhow!(
            "{} must be {} Hz mono 16-bit, got {} Hz {} channels {} bits",
            path,
            SAMPLE_RATE,
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        ));
    }
    Ok(reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let audio = match &args.input {
        Some(path) => Some(read_wav(path)?),
        None => None,
    };
    if audio.is_none() && args.text.is_none() {
        return Err(anyhow!("pass --input or --text"));
    }

    let mut request = args.url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("Device-Id", args.device_id.parse()?);
    let (ws_stream, _) = connect_async(request).await?;
    info!("connected to {}", args.url);
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let hello = json!({
        "type": "hello",
        "audio_params": {"format": "pcm", "sample_rate": SAMPLE_RATE, "channels": 1, "frame_duration": 60},
    });
    ws_sender.send(Message::Text(hello.to_string().into())).await?;

    let output = Arc::new(VirtualOutput::new(SAMPLE_RATE));
    let playback = StreamingAudioContext::new(PlaybackOption::default(), output.clone());
    let player = playback.clone();
    let play_task = tokio::spawn(async move { player.run(Box::new(PcmDecoder)).await });

    let send_loop = async {
        match (&audio, &args.text) {
            (Some(samples), _) => {
                let mut ticker = tokio::time::interval(Duration::from_millis(60));
                // Trailing silence lets the server's VAD close the utterance.
                let tail = vec![0i16; SAMPLE_RATE as usize * 3 / 2];
                for frame in samples.chunks(FRAME_SAMPLES).chain(tail.chunks(FRAME_SAMPLES)) {
                    ticker.tick().await;
                    ws_sender
                        .send(Message::Binary(samples_to_bytes(frame).into()))
                        .await?;
                }
                info!("sent {} samples", samples.len());
            }
            (None, Some(text)) => {
                let listen = json!({"type": "listen", "state": "detect", "text": text});
                ws_sender.send(Message::Text(listen.to_string().into())).await?;
            }
            (None, None) => {}
        }
        Ok::<_, anyhow::Error>(ws_sender)
    };

    let recv_loop = async {
        while let Some(message) = ws_receiver.next().await {
            match message? {
                Message::Binary(data) => playback.push_packet(data.to_vec()).await?,
                Message::Text(text) => {
                    let frame: ServerFrame = match serde_json::from_str(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("unknown server message {}: {}", text.as_str(), e);
                            continue;
                        }
                    };
                    match frame.message {
                        ServerMessage::Hello { audio_params, .. } => {
                            info!(session_id = %frame.session_id, "server hello {:?}", audio_params)
                        }
                        ServerMessage::Stt { text, .. } => info!("you: {}", text),
                        ServerMessage::Llm { text, .. } => info!("assistant: {}", text),
                        ServerMessage::Tts {
                            state: TtsState::Stop,
                            ..
                        } => {
                            info!("reply finished");
                            break;
                        }
                        ServerMessage::Tts { state, text } => debug!("tts {:?} {:?}", state, text),
                        ServerMessage::Abort => {
                            info!("server aborted playback");
                            playback.stop();
                        }
                        ServerMessage::Goodbye => {
                            info!("server said goodbye");
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    let exchange = async { tokio::try_join!(send_loop, recv_loop) };
    let ws_sender = match tokio::time::timeout(Duration::from_secs(args.timeout), exchange).await {
        Ok(result) => Some(result?.0),
        Err(_) => {
            warn!("no reply within {}s", args.timeout);
            None
        }
    };
    if let Some(mut ws_sender) = ws_sender {
        ws_sender.send(Message::Close(None)).await.ok();
    }

    playback.end_of_stream();
    play_task.await?;
    output.write_wav(&args.output)?;
    info!(
        "wrote {} buffers ({} samples) to {}",
        output.buffers().len(),
        output.render().len(),
        args.output
    );
    Ok(())
}
