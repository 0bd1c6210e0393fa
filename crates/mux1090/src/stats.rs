/*!
 * The counters behind the statistics report printed at shutdown.
 */
use rx1090::demod::DemodStats;
use tracing::info;

use crate::fleet::CprStats;
use crate::services::{ServiceKind, ServiceSet};

#[derive(Debug, Default)]
pub struct Stats {
    pub http_get_requests: u64,
    pub http_400_responses: u64,
    pub http_404_responses: u64,
    pub http_500_responses: u64,
    pub http_websockets: u64,

    pub good_raw: u64,
    pub empty_raw: u64,
    pub unrecognized_raw: u64,
    pub good_sbs: u64,
    pub unrecognized_sbs: u64,

    /// merged from the demodulator when the sample source ends
    pub demod: DemodStats,
}

impl Stats {
    pub fn merge_demod(&mut self, demod: &DemodStats) {
        let d = &mut self.demod;
        d.preambles += demod.preambles;
        for i in 0..5 {
            d.preamble_phase[i] += demod.preamble_phase[i];
            d.best_phase[i] += demod.best_phase[i];
        }
        d.rejected_bad += demod.rejected_bad;
        d.rejected_unknown_icao += demod.rejected_unknown_icao;
        d.accepted += demod.accepted;
        d.accepted_corrected += demod.accepted_corrected;
        d.samples_processed += demod.samples_processed;
        d.samples_dropped += demod.samples_dropped;
        d.noise_power_sum += demod.noise_power_sum;
        d.noise_power_count += demod.noise_power_count;
        d.signal_power_sum += demod.signal_power_sum;
        d.signal_power_count += demod.signal_power_count;
        d.peak_signal_power = d.peak_signal_power.max(demod.peak_signal_power);
        d.strong_signal_count += demod.strong_signal_count;
    }
}

fn power_db(sum: f64, count: u64) -> f64 {
    if count == 0 || sum <= 0. {
        return f64::NEG_INFINITY;
    }
    10. * (sum / count as f64).log10()
}

/// The report emitted once, at shutdown
pub fn report(
    services: &ServiceSet,
    stats: &Stats,
    cpr: &CprStats,
    messages_total: u64,
) {
    info!("Network statistics:");
    for kind in ServiceKind::ALL {
        let service = services.get(kind);
        info!(
            "  {} ({}):",
            service.kind,
            service.url.as_deref().unwrap_or("none")
        );
        let sum = service.bytes_in
            + service.bytes_out
            + service.accepted
            + service.connected
            + service.removed
            + service.unknown;
        if sum == 0 {
            info!("    nothing.");
            continue;
        }
        info!("    {:8} bytes sent", service.bytes_out);
        info!("    {:8} bytes recv", service.bytes_in);
        info!("    {:8} client connections accepted", service.accepted);
        info!("    {:8} server connections done", service.connected);
        info!("    {:8} connections removed", service.removed);
        info!("    {:8} connections unknown", service.unknown);
        info!("    {:8} open now", service.open_connections());
        info!("    {:8} unique client(s)", service.unique_clients);
        if let Some(err) = &service.last_error {
            info!("    last error: {err}");
        }
    }

    info!("HTTP statistics:");
    info!("  {:8} GET requests", stats.http_get_requests);
    info!("  {:8} 400 replies sent", stats.http_400_responses);
    info!("  {:8} 404 replies sent", stats.http_404_responses);
    info!("  {:8} 500 replies sent", stats.http_500_responses);
    info!("  {:8} WebSocket upgrades", stats.http_websockets);

    info!("Raw input statistics:");
    info!("  {:8} good messages", stats.good_raw);
    info!("  {:8} empty messages", stats.empty_raw);
    info!("  {:8} unrecognized messages", stats.unrecognized_raw);

    info!("SBS input statistics:");
    info!("  {:8} good messages", stats.good_sbs);
    info!("  {:8} unrecognized messages", stats.unrecognized_sbs);

    info!("CPR statistics:");
    info!("  {:8} airborne messages", cpr.airborne);
    info!("  {:8} surface messages", cpr.surface);
    info!("  {:8} global decodes ok", cpr.global_ok);
    info!("  {:8} global decodes bad", cpr.global_bad);
    info!("  {:8} global decodes skipped", cpr.global_skipped);
    info!("  {:8} local decodes ok", cpr.local_ok);
    info!("  {:8} local decodes skipped", cpr.local_skipped);
    info!("  {:8} dropped by the range gate", cpr.range_checks);
    info!("  {:8} dropped by the speed gate", cpr.speed_checks);

    let demod = &stats.demod;
    info!("Demodulator statistics:");
    info!("  {:8} samples processed", demod.samples_processed);
    info!("  {:8} samples dropped", demod.samples_dropped);
    info!("  {:8} preambles detected", demod.preambles);
    info!("  {:8} rejected, bad frame", demod.rejected_bad);
    info!(
        "  {:8} rejected, unknown address",
        demod.rejected_unknown_icao
    );
    info!("  {:8} accepted", demod.accepted);
    info!("  {:8} accepted with one corrected bit", demod.accepted_corrected);
    info!("  {:8} strong signals (above -3 dBFS)", demod.strong_signal_count);
    info!(
        "  mean signal power {:.1} dBFS, peak {:.1} dBFS, noise {:.1} dBFS",
        power_db(demod.signal_power_sum, demod.signal_power_count),
        10. * demod.peak_signal_power.max(1e-12).log10(),
        power_db(demod.noise_power_sum, demod.noise_power_count),
    );
    info!("  preamble phases: {:?}", demod.preamble_phase);
    info!("  best phases:     {:?}", demod.best_phase);

    info!("{messages_total} messages total");
}
