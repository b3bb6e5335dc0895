use crate::playback::decoder::PcmDecoder;
use crate::playback::output::{
    AudioContext, AudioError, AudioPlayer, OutputEvent, OutputListener, CHANNELS, SAMPLE_RATE,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type RingProducer = ringbuf::HeapProd<f32>;
type RingConsumer = ringbuf::HeapCons<f32>;

/// Smallest ring we will allocate, in samples (~50 ms of stereo audio)
const MIN_RING_SAMPLES: usize = 4410;
/// Bytes pulled from the decoder per pump step
const PUMP_CHUNK_BYTES: usize = 16 * 1024;
const IDLE_WAIT: Duration = Duration::from_millis(10);
const FULL_WAIT: Duration = Duration::from_millis(5);

/// State shared between the output callback and the players
struct OutputShared {
    producer: Mutex<RingProducer>,
    volume: AtomicU32, // 0-10000 (0.0-1.0 scaled)
    paused: AtomicBool,
    clear: AtomicBool,
    device_lost: AtomicBool,
}

/// A running output stream and the thread that owns it
struct OutputLink {
    shared: Arc<OutputShared>,
    // Dropping the sender ends the output thread and its stream
    _shutdown: mpsc::Sender<()>,
}

/// Audio output on the default CPAL device.
///
/// The CPAL stream is not `Send`, so it lives on its own thread; players feed
/// it through a shared ring. A stream that reported an error is rebuilt when
/// the next player is created.
pub struct CpalAudioContext {
    capacity: usize,
    link: Mutex<OutputLink>,
    open: OpenOutput,
}

type OpenOutput = fn(usize, u32) -> Result<OutputLink, AudioError>;

impl CpalAudioContext {
    /// Open the default output device at 44.1 kHz stereo with a ring sized for `latency`
    pub fn new(latency: Duration) -> Result<Self, AudioError> {
        let capacity = ((SAMPLE_RATE as f64 * latency.as_secs_f64()) as usize
            * CHANNELS as usize)
            .max(MIN_RING_SAMPLES);
        let context = Self::with_opener(capacity, open_output)?;

        info!(
            "Audio output ready: {} channels, {} Hz, ring of {} samples",
            CHANNELS, SAMPLE_RATE, capacity
        );
        Ok(context)
    }

    fn with_opener(capacity: usize, open: OpenOutput) -> Result<Self, AudioError> {
        Ok(Self {
            capacity,
            link: Mutex::new(open(capacity, 10000)?),
            open,
        })
    }

    /// Current output, reopened first if the device went away
    fn output(&self) -> Result<Arc<OutputShared>, AudioError> {
        let mut link = self.link.lock();
        if link.shared.device_lost.load(Ordering::SeqCst) {
            warn!("Output device was lost, reopening");
            let volume = link.shared.volume.load(Ordering::Relaxed);
            *link = (self.open)(self.capacity, volume)?;
            info!("Audio output reopened");
        }
        Ok(link.shared.clone())
    }
}

/// Start an output thread with a fresh ring and wait for its stream
fn open_output(capacity: usize, volume: u32) -> Result<OutputLink, AudioError> {
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

    let shared = Arc::new(OutputShared {
        producer: Mutex::new(producer),
        volume: AtomicU32::new(volume),
        paused: AtomicBool::new(true),
        clear: AtomicBool::new(false),
        device_lost: AtomicBool::new(false),
    });

    let (ready_tx, ready_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let thread_output = shared.clone();

    std::thread::Builder::new()
        .name("tuneline-output".to_string())
        .spawn(move || {
            let stream = match build_stream(consumer, thread_output) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Hold the stream until the link is dropped
            let _ = shutdown_rx.recv();
            drop(stream);
            info!("Output stream closed");
        })
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    ready_rx.recv().map_err(|_| AudioError::OutputThreadGone)??;

    Ok(OutputLink {
        shared,
        _shutdown: shutdown_tx,
    })
}

fn build_stream(mut consumer: RingConsumer, output: Arc<OutputShared>) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::DeviceNotFound)?;

    let config = StreamConfig {
        channels: CHANNELS,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: BufferSize::Default,
    };

    let callback_output = output.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if callback_output.clear.swap(false, Ordering::SeqCst) {
                    while consumer.try_pop().is_some() {}
                }

                if callback_output.paused.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }

                let vol = callback_output.volume.load(Ordering::Relaxed) as f32 / 10000.0;
                for sample in data.iter_mut() {
                    *sample = consumer.try_pop().unwrap_or(0.0) * vol;
                }
            },
            move |err| {
                error!("Audio stream error: {:?}", err);
                output.device_lost.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamConfigError(e.to_string()))?;

    Ok(stream)
}

impl AudioContext for CpalAudioContext {
    fn new_player(
        &self,
        decoder: Box<dyn PcmDecoder>,
        listener: OutputListener,
    ) -> Result<Box<dyn AudioPlayer>, AudioError> {
        let output = self.output()?;

        let player = Arc::new(PlayerShared {
            decoder: Mutex::new(decoder),
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        let pump_player = player.clone();
        let pump_output = output.clone();
        let pump = std::thread::Builder::new()
            .name("tuneline-pump".to_string())
            .spawn(move || run_pump(pump_player, pump_output, listener))
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        Ok(Box::new(CpalPlayer {
            player,
            output,
            pump: Some(pump),
        }))
    }
}

struct PlayerShared {
    decoder: Mutex<Box<dyn PcmDecoder>>,
    playing: AtomicBool,
    closed: AtomicBool,
    /// Bumped on every seek so the pump drops samples decoded before it
    generation: AtomicU64,
}

/// Moves PCM from the decoder into the output ring while the player is playing
fn run_pump(player: Arc<PlayerShared>, output: Arc<OutputShared>, listener: OutputListener) {
    let mut bytes = vec![0u8; PUMP_CHUNK_BYTES];
    let mut leftover = 0usize;
    let mut pending: Vec<f32> = Vec::with_capacity(PUMP_CHUNK_BYTES / 2);
    let mut generation = player.generation.load(Ordering::SeqCst);

    loop {
        if player.closed.load(Ordering::SeqCst) {
            return;
        }

        if output.device_lost.load(Ordering::SeqCst) {
            player.playing.store(false, Ordering::SeqCst);
            listener(OutputEvent::UnexpectedStop);
            return;
        }

        let current = player.generation.load(Ordering::SeqCst);
        if current != generation {
            generation = current;
            pending.clear();
            leftover = 0;
        }

        if !player.playing.load(Ordering::SeqCst) {
            std::thread::sleep(IDLE_WAIT);
            continue;
        }

        if !pending.is_empty() {
            let pushed = output.producer.lock().push_slice(&pending);
            pending.drain(..pushed);
            if !pending.is_empty() {
                std::thread::sleep(FULL_WAIT);
            }
            continue;
        }

        let read = player.decoder.lock().read(&mut bytes[leftover..]);
        match read {
            Ok(0) => {
                debug!("Decoder drained");
                player.playing.store(false, Ordering::SeqCst);
                listener(OutputEvent::Finished);
            }
            Ok(n) => {
                let total = leftover + n;
                let whole = total - total % 2;
                pending.extend(
                    bytes[..whole]
                        .chunks_exact(2)
                        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0),
                );
                leftover = total - whole;
                if leftover == 1 {
                    bytes[0] = bytes[whole];
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if player.closed.load(Ordering::SeqCst) {
                    return;
                }
                error!("Decoder failed during playback: {}", e);
                player.playing.store(false, Ordering::SeqCst);
                listener(OutputEvent::UnexpectedStop);
                return;
            }
        }
    }
}

/// Player handle returned by [`CpalAudioContext`]
pub struct CpalPlayer {
    player: Arc<PlayerShared>,
    output: Arc<OutputShared>,
    pump: Option<JoinHandle<()>>,
}

impl AudioPlayer for CpalPlayer {
    fn play(&mut self) {
        self.player.playing.store(true, Ordering::SeqCst);
        self.output.paused.store(false, Ordering::SeqCst);
    }

    fn pause(&mut self) {
        self.player.playing.store(false, Ordering::SeqCst);
        self.output.paused.store(true, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.player.playing.load(Ordering::SeqCst)
    }

    fn set_volume(&mut self, volume: f64) {
        self.output
            .volume
            .store((volume.clamp(0.0, 1.0) * 10000.0) as u32, Ordering::Relaxed);
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = self.player.decoder.lock().seek(pos)?;
        self.player.generation.fetch_add(1, Ordering::SeqCst);
        self.output.clear.store(true, Ordering::SeqCst);
        Ok(new_pos)
    }

    fn close(&mut self) {
        if self.player.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.player.playing.store(false, Ordering::SeqCst);
        self.output.clear.store(true, Ordering::SeqCst);
        // The pump may be blocked on a network read; let it finish on its own
        drop(self.pump.take());
    }
}

impl Drop for CpalPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::decoder::{DecoderFactory, RawPcmDecoderFactory};
    use crate::playback::streaming::{BufferedStream, BufferingConfig};
    use crate::test_support::{pattern, MemorySource};
    use std::sync::atomic::AtomicUsize;

    static OPENS: AtomicUsize = AtomicUsize::new(0);

    /// Output link with no device behind it
    fn open_detached(capacity: usize, volume: u32) -> Result<OutputLink, AudioError> {
        OPENS.fetch_add(1, Ordering::SeqCst);
        let (producer, _consumer) = HeapRb::<f32>::new(capacity).split();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel();
        Ok(OutputLink {
            shared: Arc::new(OutputShared {
                producer: Mutex::new(producer),
                volume: AtomicU32::new(volume),
                paused: AtomicBool::new(true),
                clear: AtomicBool::new(false),
                device_lost: AtomicBool::new(false),
            }),
            _shutdown: shutdown_tx,
        })
    }

    fn decoder() -> Box<dyn PcmDecoder> {
        let stream = BufferedStream::new(
            Box::new(MemorySource::new(pattern(4096))),
            4096,
            BufferingConfig::default(),
        );
        RawPcmDecoderFactory.open(stream).unwrap()
    }

    #[test]
    fn test_lost_device_is_reopened_for_next_player() {
        let context = CpalAudioContext::with_opener(MIN_RING_SAMPLES, open_detached).unwrap();
        let opened = OPENS.load(Ordering::SeqCst);

        let mut first = context.new_player(decoder(), Arc::new(|_| {})).unwrap();
        first.set_volume(0.25);
        let lost = context.link.lock().shared.clone();
        lost.device_lost.store(true, Ordering::SeqCst);

        let mut second = context.new_player(decoder(), Arc::new(|_| {})).unwrap();

        assert_eq!(OPENS.load(Ordering::SeqCst), opened + 1);
        let current = context.link.lock().shared.clone();
        assert!(!Arc::ptr_eq(&lost, &current));
        assert!(!current.device_lost.load(Ordering::SeqCst));
        assert_eq!(current.volume.load(Ordering::SeqCst), 2500);

        first.close();
        second.close();
    }
}
