use crate::playback::decoder::{DecoderError, DecoderFactory, PcmDecoder};
use crate::playback::output::SAMPLE_RATE;
use crate::playback::streaming::BufferedStream;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};
use tracing::{debug, info, warn};

/// Undecodable packets tolerated in a row before the stream is given up
const MAX_DECODE_ERRORS: u32 = 16;

/// Decodes a buffered stream into s16le stereo at the output sample rate
pub struct SymphoniaDecoder {
    stream: BufferedStream,
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    duration: Option<Duration>,
    sample_buf: Option<SampleBuffer<f32>>,
    pcm: Vec<u8>,
    pcm_pos: usize,
    at_end: bool,
}

impl SymphoniaDecoder {
    /// Probe the stream and prepare a decoder for its first audio track
    pub fn new(stream: BufferedStream) -> Result<Self, DecoderError> {
        let media_source = MediaSourceStream::new(Box::new(stream.clone()), Default::default());

        let mut hint = Hint::new();
        hint.with_extension("mp3");

        let probed = symphonia::default::get_probe().format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecoderError::NoAudioTracks)?;

        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(SAMPLE_RATE);
        let duration = track.codec_params.n_frames.map(|n_frames| {
            Duration::from_secs_f64(n_frames as f64 / sample_rate as f64)
        });

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())?;

        info!(
            "Decoder ready: {} Hz, duration {:?}, {} bytes",
            sample_rate,
            duration,
            stream.len()
        );

        Ok(Self {
            stream,
            format_reader,
            decoder,
            track_id,
            sample_rate,
            duration,
            sample_buf: None,
            pcm: Vec::new(),
            pcm_pos: 0,
            at_end: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Decode packets until one yields PCM. Returns false at end of stream.
    fn decode_next(&mut self) -> Result<bool, DecoderError> {
        let mut decode_errors = 0;
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(DecoderError::Symphonia(e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) if decode_errors < MAX_DECODE_ERRORS => {
                    decode_errors += 1;
                    warn!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecoderError::Symphonia(e)),
            };

            decode_errors = 0;
            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            let needed = decoded.capacity() * channels;
            if self
                .sample_buf
                .as_ref()
                .map_or(true, |buf| buf.capacity() < needed)
            {
                self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }
            let Some(sample_buf) = self.sample_buf.as_mut() else {
                continue;
            };
            sample_buf.copy_interleaved_ref(decoded);

            self.pcm.clear();
            self.pcm_pos = 0;
            write_stereo_s16le(sample_buf.samples(), channels, spec.rate, &mut self.pcm);

            if !self.pcm.is_empty() {
                return Ok(true);
            }
        }
    }
}

/// Convert interleaved f32 frames to stereo s16le at the output rate,
/// linearly interpolating between neighbouring source frames.
fn write_stereo_s16le(samples: &[f32], channels: usize, rate: u32, out: &mut Vec<u8>) {
    if channels == 0 {
        return;
    }
    let frames = samples.len() / channels;
    if frames == 0 {
        return;
    }

    let frame_at = |idx: usize| -> (f32, f32) {
        let base = idx.min(frames - 1) * channels;
        if channels == 1 {
            (samples[base], samples[base])
        } else {
            (samples[base], samples[base + 1])
        }
    };

    let ratio = rate as f64 / SAMPLE_RATE as f64;
    let out_frames = if rate == SAMPLE_RATE {
        frames
    } else {
        (frames as f64 / ratio).floor() as usize
    };

    out.reserve(out_frames * 4);
    for i in 0..out_frames {
        let src = i as f64 * ratio;
        let idx = src.floor() as usize;
        let frac = (src - idx as f64) as f32;
        let (l0, r0) = frame_at(idx);
        let (l1, r1) = frame_at(idx + 1);
        out.extend_from_slice(&to_s16(l0 + (l1 - l0) * frac).to_le_bytes());
        out.extend_from_slice(&to_s16(r0 + (r1 - r0) * frac).to_le_bytes());
    }
}

fn to_s16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

impl Read for SymphoniaDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.at_end {
            return Ok(0);
        }

        while self.pcm_pos >= self.pcm.len() {
            match self.decode_next() {
                Ok(true) => {}
                Ok(false) => {
                    self.at_end = true;
                    return Ok(0);
                }
                Err(e) => return Err(io::Error::other(e)),
            }
        }

        let n = buf.len().min(self.pcm.len() - self.pcm_pos);
        buf[..n].copy_from_slice(&self.pcm[self.pcm_pos..self.pcm_pos + n]);
        self.pcm_pos += n;
        Ok(n)
    }
}

impl Seek for SymphoniaDecoder {
    /// Offsets address the encoded stream; they are mapped to a time
    /// through the track duration and handed to the format reader.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.stream.len();
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(offset) => self.stream.position() as i128 + offset as i128,
            SeekFrom::End(offset) => len as i128 + offset as i128,
        };
        if target < 0 || target > len as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Seek target {} outside [0, {}]", target, len),
            ));
        }
        let target = target as u64;

        self.pcm.clear();
        self.pcm_pos = 0;

        if target == len && len > 0 {
            self.at_end = true;
            return Ok(target);
        }

        let seconds = if target == 0 {
            0.0
        } else {
            let duration = self.duration.ok_or_else(|| {
                io::Error::new(io::ErrorKind::Unsupported, DecoderError::UnknownDuration)
            })?;
            duration.as_secs_f64() * (target as f64 / len as f64)
        };

        let time = Time::new(seconds.trunc() as u64, seconds.fract());
        self.format_reader
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(io::Error::other)?;
        self.decoder.reset();
        self.at_end = false;

        debug!("Decoder seek to byte {} ({:.2}s)", target, seconds);
        Ok(target)
    }
}

/// Opens a [`SymphoniaDecoder`] per stream
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn open(&self, stream: BufferedStream) -> Result<Box<dyn PcmDecoder>, DecoderError> {
        Ok(Box::new(SymphoniaDecoder::new(stream)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_pcm(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_mono_is_duplicated_to_stereo() {
        let mut out = Vec::new();
        write_stereo_s16le(&[0.5, -0.5], 1, SAMPLE_RATE, &mut out);

        let pcm = decode_pcm(&out);
        assert_eq!(pcm.len(), 4);
        assert_eq!(pcm[0], pcm[1]);
        assert_eq!(pcm[2], pcm[3]);
        assert!(pcm[0] > 0 && pcm[2] < 0);
    }

    #[test]
    fn test_resampling_scales_frame_count() {
        let samples = vec![0.0f32; 2 * 22_050];
        let mut out = Vec::new();
        write_stereo_s16le(&samples, 2, 22_050, &mut out);

        assert_eq!(out.len() / 4, 44_100);
    }

    #[test]
    fn test_extra_channels_are_dropped() {
        let mut out = Vec::new();
        write_stereo_s16le(&[1.0, -1.0, 0.25, 0.25, 0.0, 0.0], 3, SAMPLE_RATE, &mut out);

        let pcm = decode_pcm(&out);
        assert_eq!(pcm, vec![i16::MAX, -i16::MAX, 0, 0]);
    }

    #[test]
    fn test_garbage_stream_is_rejected() {
        let data = vec![0u8; 4096];
        let source = crate::test_support::MemorySource::new(data);
        let stream = BufferedStream::new(Box::new(source), 4096, Default::default());

        assert!(SymphoniaDecoderFactory.open(stream).is_err());
    }
}
