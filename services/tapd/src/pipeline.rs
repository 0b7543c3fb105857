// Event enrichment pipeline: the stage between an interceptor's channel and
// the broker's subscribers.
//
// Order matters: the template is computed first because the N+1 detector is
// keyed by it, so simple queries differing only in literal values still
// group into one pattern.
use sqltap_broker::Broker;
use sqltap_common::{Event, Op};
use sqltap_detect::Detector;
use sqltap_query::normalize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Consume captured events until the channel closes.
pub async fn run(
    mut events: mpsc::Receiver<Event>,
    broker: Arc<Broker>,
    detector: Option<Arc<Detector>>,
    slow_threshold: Duration,
) {
    while let Some(mut event) = events.recv().await {
        if !event.query.is_empty() {
            event.normalized_query = normalize(&event.query);
        }

        if let Some(detector) = &detector {
            if is_select_query(event.op, &event.query) {
                let outcome = detector.record(&event.normalized_query, event.start_time);
                event.nplus1 = outcome.matched;
                if let Some(alert) = outcome.alert {
                    tracing::warn!(
                        query = %alert.query,
                        count = alert.count,
                        "n+1 query pattern detected"
                    );
                    metrics::counter!("sqltap_nplus1_alerts_total").increment(1);
                }
            }
        }

        if slow_threshold > Duration::ZERO && event.duration >= slow_threshold {
            event.slow_query = true;
        }

        broker.publish(event);
    }
}

// Only SELECTs issued as Query/Exec/Execute feed the detector; transaction
// control and prepare/bind traffic never does.
fn is_select_query(op: Op, query: &str) -> bool {
    if !matches!(op, Op::Query | Op::Exec | Op::Execute) {
        return false;
    }
    let trimmed = query.trim_start();
    trimmed.len() >= 6 && trimmed.as_bytes()[..6].eq_ignore_ascii_case(b"SELECT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn select_event(id: u64, start_time: SystemTime) -> Event {
        let mut event = Event::new(
            id.to_string(),
            Op::Execute,
            "SELECT name FROM users WHERE id = $1",
        );
        event.start_time = start_time;
        event
    }

    async fn drive(
        inputs: Vec<Event>,
        detector: Option<Arc<Detector>>,
        slow_threshold: Duration,
    ) -> Vec<Event> {
        let broker = Arc::new(Broker::new(64));
        let mut sub = broker.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let count = inputs.len();
        for event in inputs {
            tx.try_send(event).expect("enqueue");
        }
        drop(tx);
        run(rx, Arc::clone(&broker), detector, slow_threshold).await;

        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(sub.recv().await.expect("event"));
        }
        out
    }

    #[tokio::test]
    async fn normalizes_queries_before_publishing() {
        let event = Event::new("1".into(), Op::Query, "SELECT id FROM t WHERE id = 42");
        let out = drive(vec![event], None, Duration::ZERO).await;
        assert_eq!(out[0].normalized_query, "SELECT id FROM t WHERE id = ?");
    }

    #[tokio::test]
    async fn flags_the_whole_pattern_once_threshold_is_crossed() {
        let detector = Arc::new(Detector::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        let base = SystemTime::now();
        let inputs: Vec<Event> = (0..10)
            .map(|i| select_event(i, base + Duration::from_millis(i * 50)))
            .collect();

        let out = drive(inputs, Some(detector), Duration::ZERO).await;
        for (i, event) in out.iter().enumerate() {
            assert_eq!(event.nplus1, i >= 4, "event {i}");
        }
    }

    #[tokio::test]
    async fn literal_variants_group_into_one_pattern() {
        // Same shape, different literals: the template keys the detector.
        let detector = Arc::new(Detector::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        let base = SystemTime::now();
        let inputs: Vec<Event> = (0..3)
            .map(|i| {
                let mut event = Event::new(
                    i.to_string(),
                    Op::Query,
                    format!("SELECT name FROM users WHERE id = {i}"),
                );
                event.start_time = base + Duration::from_millis(i * 10);
                event
            })
            .collect();

        let out = drive(inputs, Some(detector), Duration::ZERO).await;
        assert!(out[2].nplus1, "third literal variant crosses the threshold");
    }

    #[tokio::test]
    async fn non_select_ops_bypass_the_detector() {
        let detector = Arc::new(Detector::new(
            1,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        let mut begin = Event::new("1".into(), Op::Begin, "BEGIN");
        begin.start_time = SystemTime::now();
        let out = drive(vec![begin], Some(detector), Duration::ZERO).await;
        assert!(!out[0].nplus1);
    }

    #[tokio::test]
    async fn slow_threshold_flags_slow_events_only() {
        let mut fast = Event::new("1".into(), Op::Query, "SELECT 1");
        fast.duration = Duration::from_millis(20);
        let mut slow = Event::new("2".into(), Op::Query, "SELECT 2");
        slow.duration = Duration::from_millis(200);

        let out = drive(vec![fast, slow], None, Duration::from_millis(100)).await;
        assert!(!out[0].slow_query);
        assert!(out[1].slow_query);
    }

    #[tokio::test]
    async fn zero_slow_threshold_disables_the_flag() {
        let mut event = Event::new("1".into(), Op::Query, "SELECT 1");
        event.duration = Duration::from_secs(5);
        let out = drive(vec![event], None, Duration::ZERO).await;
        assert!(!out[0].slow_query);
    }

    #[test]
    fn select_classification() {
        assert!(is_select_query(Op::Query, "SELECT 1"));
        assert!(is_select_query(Op::Execute, "  select id from t"));
        assert!(is_select_query(Op::Exec, "SELECT name FROM users"));
        assert!(!is_select_query(Op::Query, "INSERT INTO t VALUES (1)"));
        assert!(!is_select_query(Op::Begin, "SELECT 1"));
        assert!(!is_select_query(Op::Prepare, "SELECT 1"));
        assert!(!is_select_query(Op::Query, "SEL"));
    }
}
