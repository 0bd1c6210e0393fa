/*!
 * Prerecorded sample replay: 8-bit interleaved I/Q pairs as rtl_sdr
 * writes them, demodulated buffer by buffer.
 */
use rx1090::decode::time::now_in_s;
use rx1090::demod::{
    DemodConfig, DemodStats, Demodulator, MagnitudeBuffer, MagnitudeTable,
    FRAME_WINDOW,
};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::Sender;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::Input;

/// Samples per demodulated buffer
const BUFFER_SAMPLES: usize = 131_072;

const SAMPLE_RATE: f64 = 2_400_000.;

pub struct Replay {
    pub path: String,
    pub throttle: bool,
    pub demod: DemodConfig,
}

/// Feed the whole file through the demodulator, queueing every accepted
/// frame. Returns the demodulator counters for the shutdown report.
pub async fn run(
    config: Replay,
    tx: Sender<Input>,
) -> std::io::Result<DemodStats> {
    let table = MagnitudeTable::new();
    let mut demod = Demodulator::new(config.demod);
    let mut file = File::open(&config.path).await?;
    info!("replaying samples from {}", config.path);

    let mut iq = vec![0u8; 2 * BUFFER_SAMPLES];
    // the tail of each buffer is carried over so frames crossing the
    // boundary still demodulate
    let mut carry: Vec<u16> = Vec::new();
    let mut consumed: u64 = 0;
    let started = now_in_s();

    'replay: loop {
        let mut filled = 0;
        while filled < iq.len() {
            match file.read(&mut iq[filled..]).await? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            break;
        }

        let mut data = std::mem::take(&mut carry);
        data.extend(table.compute(&iq[..filled]));

        let sample_timestamp = consumed * 5;
        let system_timestamp = started + consumed as f64 / SAMPLE_RATE;
        let mag =
            MagnitudeBuffer::new(data, sample_timestamp, system_timestamp);

        for msg in demod.demodulate(&mag) {
            let input = Input::Frame {
                bytes: msg.bytes[..msg.byte_len].to_vec(),
                timestamp: Some(msg.timestamp),
                system_timestamp: msg.system_timestamp,
                signal: Some(msg.signal_level),
            };
            if tx.send(input).await.is_err() {
                break 'replay;
            }
        }

        let keep = FRAME_WINDOW.min(mag.data.len());
        let fresh = mag.data.len() - keep;
        carry = mag.data[fresh..].to_vec();
        consumed += fresh as u64;

        if config.throttle {
            sleep(Duration::from_secs_f64(
                (filled / 2) as f64 / SAMPLE_RATE,
            ))
            .await;
        }
    }

    info!(
        "replay done: {} samples, {} accepted",
        demod.stats.samples_processed,
        demod.stats.accepted + demod.stats.accepted_corrected
    );
    Ok(demod.stats.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_file_produces_no_frames() {
        let mut path = std::env::temp_dir();
        path.push("mux1090-replay-test.bin");
        // 4096 zero-magnitude I/Q pairs
        std::fs::write(&path, vec![127u8; 8192]).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let stats = run(
            Replay {
                path: path.to_string_lossy().to_string(),
                throttle: false,
                demod: DemodConfig::default(),
            },
            tx,
        )
        .await
        .unwrap();

        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.samples_processed, 4096);
        assert!(rx.try_recv().is_err());

        std::fs::remove_file(&path).ok();
    }
}
