use std::time::{Duration, Instant};

use paced_sender::{Bitrate, PacerConfig, PacerReason, PacketKind};
use paced_sender::{ProbeClusterConfig, ProbeClusterId};

mod common;
use common::{init_log, ms, video, Sent, Sim};

const PROBE_RATE: Bitrate = Bitrate::bytes_per_sec(1_000_000);

fn sim() -> Sim {
    let config = PacerConfig::new().set_initial_rates(Bitrate::mbps(1), Bitrate::ZERO);
    Sim::new(config)
}

/// Send times of the probe bursts, in order.
fn burst_times<'a>(sent: impl Iterator<Item = &'a Sent>) -> Vec<Instant> {
    let mut times: Vec<Instant> = vec![];
    for s in sent.filter(|s| s.probe.is_some()) {
        if times.last() != Some(&s.at) {
            times.push(s.at);
        }
    }
    times
}

#[test]
pub fn probe_cluster_is_sent_in_spaced_bursts() {
    init_log();

    let mut sim = sim();
    let id = ProbeClusterId::new(1);

    let now = sim.now;
    sim.pacer
        .create_probe_clusters(now, [ProbeClusterConfig::new(id, PROBE_RATE)])
        .unwrap();
    sim.enqueue((0..40).map(|_| video(1, 1000)));

    sim.advance(Duration::ZERO);
    assert!(sim.pacer.is_probing(sim.now));

    sim.advance(ms(100));
    assert!(!sim.pacer.is_probing(sim.now), "Cluster retired");

    let probes: Vec<_> = sim.sender.probes().collect();
    assert!(probes.iter().all(|s| {
        let info = s.probe.unwrap();
        info.cluster_id == id && info.target_rate == PROBE_RATE && info.target_probe_count == 5
    }));

    // Five 2000 byte bursts every 2ms. The probe count is reached before the 15ms duration.
    let times = burst_times(sim.sender.sent.iter());
    assert_eq!(times.len(), 5);
    assert_eq!(probes.len(), 10);

    for pair in times.windows(2) {
        let spacing = pair[1] - pair[0];
        assert!(
            spacing >= ms(2) && spacing <= ms(3),
            "Burst spacing {spacing:?}"
        );
    }
}

#[test]
pub fn probe_bursts_respect_min_probe_delta() {
    init_log();

    let mut sim = sim();
    let config = ProbeClusterConfig::new(ProbeClusterId::new(2), PROBE_RATE)
        .with_duration(ms(100))
        .with_min_probe_delta(ms(5));

    let now = sim.now;
    sim.pacer.create_probe_clusters(now, [config]).unwrap();
    sim.enqueue((0..60).map(|_| video(1, 1000)));

    sim.advance(ms(200));

    let times = burst_times(sim.sender.sent.iter());
    assert_eq!(times.len(), 5);

    for pair in times.windows(2) {
        let spacing = pair[1] - pair[0];
        assert!(
            spacing >= ms(5) && spacing <= ms(6),
            "Burst spacing {spacing:?}"
        );
    }
}

#[test]
pub fn cluster_ends_when_duration_runs_out() {
    init_log();

    let mut sim = sim();
    sim.sender.padding = true;
    let config = ProbeClusterConfig::new(ProbeClusterId::new(8), PROBE_RATE)
        .with_probe_count(100)
        .with_duration(ms(10));

    let now = sim.now;
    sim.pacer.create_probe_clusters(now, [config]).unwrap();
    sim.enqueue([video(1, 1000)]);

    sim.advance(ms(100));
    assert!(!sim.pacer.is_probing(sim.now));

    // Bursts at 0, 2, 4, 6, 8 and 10ms. The one at 10ms ends the cluster.
    let times = burst_times(sim.sender.sent.iter());
    assert_eq!(times.len(), 6);

    let last = sim.since_start(*times.last().unwrap());
    assert!(last >= ms(10) && last < ms(11), "Last burst at {last:?}");
}

#[test]
pub fn bursts_ignore_coalescing_window() {
    init_log();

    let config = PacerConfig::new()
        .set_coalescing_window(ms(5))
        .set_initial_rates(Bitrate::bytes_per_sec(500_000), Bitrate::ZERO);
    let mut sim = Sim::new(config);

    let now = sim.now;
    sim.pacer
        .create_probe_clusters(
            now,
            [ProbeClusterConfig::new(ProbeClusterId::new(9), PROBE_RATE)],
        )
        .unwrap();
    sim.enqueue((0..40).map(|_| video(1, 1000)));

    // The media budget clears in 2ms but paced sends at the start hold back for 5ms. The next
    // burst is due at 2ms regardless.
    sim.advance(Duration::ZERO);
    assert_eq!(
        sim.pacer.poll_timeout(),
        (Some(sim.start + ms(2)), PacerReason::Probe)
    );

    sim.advance(ms(50));

    let times = burst_times(sim.sender.sent.iter());
    assert_eq!(times.len(), 5);
    assert_eq!(times[0], sim.start);

    for pair in times.windows(2) {
        let spacing = pair[1] - pair[0];
        assert!(
            spacing >= ms(2) && spacing < ms(3),
            "Burst spacing {spacing:?}"
        );
    }
}

#[test]
pub fn probe_tops_up_with_padding() {
    init_log();

    let mut sim = sim();
    sim.sender.padding = true;

    let now = sim.now;
    sim.pacer
        .create_probe_clusters(
            now,
            [ProbeClusterConfig::new(ProbeClusterId::new(3), PROBE_RATE)],
        )
        .unwrap();
    sim.enqueue([video(1, 1000)]);

    sim.advance(ms(100));

    let kinds: Vec<_> = sim.sender.probes().map(|s| s.packet.kind).collect();
    assert_eq!(kinds.first(), Some(&PacketKind::Video), "Media goes first");
    assert!(kinds[1..].iter().all(|k| *k == PacketKind::Padding));
    assert!(!sim.sender.padding_requests.is_empty());

    // The padding rate is zero, nothing is sent once the cluster is done.
    assert_eq!(sim.sender.sent.len(), kinds.len());
}

#[test]
pub fn failed_probe_waits_for_next_enqueue() {
    init_log();

    let mut sim = sim();

    let now = sim.now;
    sim.pacer
        .create_probe_clusters(
            now,
            [ProbeClusterConfig::new(ProbeClusterId::new(4), PROBE_RATE)],
        )
        .unwrap();
    sim.enqueue([video(1, 1000)]);

    sim.advance(ms(1));
    assert_eq!(sim.sender.probes().count(), 1);

    // The second burst finds nothing to send.
    sim.advance(ms(1));
    assert_eq!(sim.pacer.poll_timeout(), (None, PacerReason::Idle));

    sim.enqueue([video(1, 1000)]);
    sim.advance(Duration::ZERO);

    assert_eq!(sim.sender.probes().count(), 2);
    assert!(sim.pacer.is_probing(sim.now));
}

#[test]
pub fn probing_needs_a_large_enough_packet() {
    init_log();

    let mut sim = sim();

    let now = sim.now;
    sim.pacer
        .create_probe_clusters(
            now,
            [ProbeClusterConfig::new(ProbeClusterId::new(5), PROBE_RATE)],
        )
        .unwrap();

    sim.enqueue([video(1, 100)]);
    sim.advance(ms(10));
    assert_eq!(sim.sent_count(), 1);
    assert_eq!(sim.sender.probes().count(), 0);

    sim.enqueue([video(1, 1000)]);
    sim.advance(Duration::ZERO);
    assert_eq!(sim.sender.probes().count(), 1);
}

#[test]
pub fn probe_waits_for_at_time() {
    init_log();

    let mut sim = sim();
    let at_time = sim.start + ms(50);
    let config = ProbeClusterConfig::new(ProbeClusterId::new(6), PROBE_RATE).with_at_time(at_time);

    let now = sim.now;
    sim.pacer.create_probe_clusters(now, [config]).unwrap();
    sim.enqueue((0..20).map(|_| video(1, 1000)));

    sim.advance(ms(49));
    assert_eq!(sim.sender.probes().count(), 0);
    assert!(sim.sent_count() > 0, "Media is paced meanwhile");

    sim.advance(ms(1));
    let first = sim.sender.probes().next().expect("a probe");
    assert_eq!(first.at, at_time);
}

#[test]
pub fn unstarted_cluster_times_out() {
    init_log();

    let config = PacerConfig::new()
        .set_probe_cluster_timeout(Duration::from_secs(1))
        .set_initial_rates(Bitrate::mbps(1), Bitrate::ZERO);
    let mut sim = Sim::new(config);

    let now = sim.now;
    sim.pacer
        .create_probe_clusters(
            now,
            [ProbeClusterConfig::new(ProbeClusterId::new(7), PROBE_RATE)],
        )
        .unwrap();

    // Nothing arms probing for longer than the timeout.
    sim.advance(Duration::from_secs(2));

    sim.enqueue((0..5).map(|_| video(1, 1000)));
    sim.advance(ms(100));

    assert_eq!(sim.sent_count(), 5);
    assert_eq!(sim.sender.probes().count(), 0);
    assert!(!sim.pacer.is_probing(sim.now));
}

#[test]
pub fn clusters_run_in_request_order() {
    init_log();

    let mut sim = sim();
    let first = ProbeClusterConfig::new(ProbeClusterId::new(10), PROBE_RATE);
    let second = ProbeClusterConfig::new(ProbeClusterId::new(11), Bitrate::bytes_per_sec(500_000));

    let now = sim.now;
    sim.pacer.create_probe_clusters(now, [first, second]).unwrap();
    sim.enqueue((0..60).map(|_| video(1, 1000)));

    sim.advance(ms(200));

    let ids: Vec<_> = sim
        .sender
        .probes()
        .map(|s| s.probe.unwrap().cluster_id)
        .collect();
    let switch = ids
        .iter()
        .position(|id| *id == ProbeClusterId::new(11))
        .expect("second cluster probed");

    assert!(switch > 0);
    assert!(ids[..switch].iter().all(|id| *id == ProbeClusterId::new(10)));
    assert!(ids[switch..].iter().all(|id| *id == ProbeClusterId::new(11)));
}
