//! Property-based tests of the pure pieces of the write path

use proptest::prelude::*;
use relaydb::coordinator::fifo::EventFifo;
use relaydb::events::{Event, Host, StreamKind};
use relaydb::perfdata::{float_equal, parse_perfdata};

fn host(id: u64) -> Event {
    Event::Host(Host {
        host_id: id,
        ..Host::default()
    })
}

proptest! {
    /// Acks never outrun the submission order: no matter in which order
    /// events complete, the released count only covers the committed prefix.
    #[test]
    fn acks_respect_submission_order(order in proptest::sample::subsequence(vec![0usize, 1, 2, 3, 4, 5, 6, 7], 0..=8)) {
        let mut fifo = EventFifo::default();
        for i in 0..8u64 {
            fifo.push(StreamKind::Sql, host(i));
        }
        let entries = fifo.drain_events();
        let entries: Vec<_> = entries.into_iter().collect();

        for &i in &order {
            entries[i].mark_done();
        }
        let released = fifo.clean(StreamKind::Sql);

        // The released prefix is exactly the run of completed events at the
        // front of the timeline.
        let mut expected = 0;
        while order.contains(&expected) {
            expected += 1;
        }
        prop_assert_eq!(released, expected);
        prop_assert_eq!(fifo.timeline_len(StreamKind::Sql), 8 - expected);
    }

    /// Equality of stored metric values is reflexive and symmetric, including
    /// the NaN and infinity encodings perfdata can produce.
    #[test]
    fn float_equality_is_symmetric(a in proptest::num::f64::ANY, b in proptest::num::f64::ANY) {
        prop_assert!(float_equal(a, a));
        prop_assert_eq!(float_equal(a, b), float_equal(b, a));
    }

    /// Any parsed sample keeps the value that was printed into the string
    #[test]
    fn parsed_value_roundtrips(value in -1.0e9f64..1.0e9) {
        let input = format!("metric={value}");
        let parsed = parse_perfdata(&input).unwrap();
        prop_assert_eq!(parsed.len(), 1);
        prop_assert!((parsed[0].value - value).abs() <= value.abs() * 1e-12);
    }

    /// The parser never panics on arbitrary input
    #[test]
    fn parser_never_panics(input in "[ -~]{0,64}") {
        let _ = parse_perfdata(&input);
    }
}
