use fast_ring::{DualRing, RingConsumer, RingError, EOF_SLOTS};

const MIN_FRAGMENT: usize = 3; // header + one int + trailer

#[test]
fn single_thread_round_trip() {
    let (mut producer, mut consumer) = DualRing::with_bits(7, 6).split();

    producer.begin_fragment(0, 8).unwrap();
    producer.write_int(17);
    producer.write_long(0x0123_4567_89AB_CDEF);
    producer.write_decimal(-2, 314159);
    producer.end_fragment();
    producer.publish();

    assert_eq!(consumer.try_peek(), Some(0));
    assert!(consumer.begin_fragment(8));
    assert_eq!(consumer.read_int(), 17);
    assert_eq!(consumer.read_long(), 0x0123_4567_89AB_CDEF);
    assert_eq!(consumer.read_decimal(), (-2, 314159));
    consumer.release_fragment();
    assert_eq!(consumer.try_peek(), None);
}

#[test]
fn negative_longs_survive_the_two_slot_split() {
    let (mut producer, mut consumer) = DualRing::with_bits(7, 6).split();
    for value in [-1i64, i64::MIN, i64::MAX, -4_294_967_296, 4_294_967_295] {
        producer.begin_fragment(0, 4).unwrap();
        producer.write_long(value);
        producer.end_fragment();
    }
    producer.publish();
    for value in [-1i64, i64::MIN, i64::MAX, -4_294_967_296, 4_294_967_295] {
        assert!(consumer.begin_fragment(4));
        assert_eq!(consumer.read_long(), value);
        consumer.release_fragment();
    }
}

#[test]
fn blob_payloads_wrap_and_replay() {
    // 32-byte blob so payloads wrap quickly.
    let (mut producer, mut consumer) = DualRing::with_bits(7, 5).split();

    for round in 0u8..16 {
        let payload: Vec<u8> = (0..13).map(|i| round.wrapping_mul(31).wrapping_add(i)).collect();
        producer.begin_fragment(0, 5).unwrap();
        producer.append_bytes(&payload).unwrap();
        producer.write_int(round as i32);
        producer.end_fragment();
        producer.publish();

        assert!(consumer.begin_fragment(5));
        let (meta, len) = consumer.read_bytes_meta();
        assert_eq!(len, 13);
        let mut copied = Vec::new();
        consumer.blob_bytes(meta, len as usize).copy_to(&mut copied);
        assert_eq!(copied, payload);
        assert_eq!(consumer.read_int(), round as i32);
        consumer.release_fragment();
    }
}

#[test]
fn mark_reset_replays_fragments() {
    let (mut producer, mut consumer) = DualRing::with_bits(7, 6).split();
    for value in 0..4 {
        producer.begin_fragment(9, MIN_FRAGMENT).unwrap();
        producer.write_int(value);
        producer.end_fragment();
    }
    producer.publish();

    // Peek two fragments, reject them, then read all four. The release
    // batch is kept wider than the replay window so the producer never
    // observes the rewound cursors.
    consumer.set_batch_release(16);
    consumer.mark();
    for expected in 0..2 {
        assert!(consumer.begin_fragment(MIN_FRAGMENT));
        assert_eq!(consumer.msg_idx(), 9);
        assert_eq!(consumer.read_int(), expected);
        consumer.release_fragment();
    }
    consumer.reset();
    for expected in 0..4 {
        assert!(consumer.begin_fragment(MIN_FRAGMENT));
        assert_eq!(consumer.read_int(), expected);
        consumer.release_fragment();
    }
    consumer.release_tails();
}

#[test]
fn abandon_discards_partial_fragment() {
    let (mut producer, mut consumer) = DualRing::with_bits(7, 6).split();
    producer.begin_fragment(1, 5).unwrap();
    producer.write_int(111);
    producer.append_bytes(b"junk").unwrap();
    producer.abandon();

    producer.begin_fragment(2, MIN_FRAGMENT).unwrap();
    producer.write_int(222);
    producer.end_fragment();
    producer.publish();

    assert_eq!(consumer.try_peek(), Some(2));
    assert!(consumer.begin_fragment(MIN_FRAGMENT));
    assert_eq!(consumer.read_int(), 222);
    consumer.release_fragment();
}

#[test]
fn eof_sentinel_observed() {
    let (mut producer, mut consumer) = DualRing::with_bits(6, 0).split();
    producer.publish_eof().unwrap();
    let idx = consumer.try_peek().unwrap();
    assert!(RingConsumer::is_eof(idx));
    assert!(consumer.begin_fragment(EOF_SLOTS));
    consumer.release_fragment();
}

#[test]
fn try_begin_reports_overflow_without_blocking() {
    // 4-slot slab fits exactly one minimal fragment.
    let (mut producer, _consumer) = DualRing::with_bits(2, 0).split();
    producer.begin_fragment(0, MIN_FRAGMENT).unwrap();
    producer.write_int(0);
    producer.end_fragment();
    assert_eq!(
        producer.try_begin_fragment(0, MIN_FRAGMENT),
        Err(RingError::Overflow)
    );
}

#[test]
fn shutdown_breaks_a_blocked_producer() {
    let (mut producer, consumer) = DualRing::with_bits(2, 0).split();
    producer.begin_fragment(0, MIN_FRAGMENT).unwrap();
    producer.write_int(0);
    producer.end_fragment();
    consumer.request_shutdown();
    assert_eq!(
        producer.begin_fragment(0, MIN_FRAGMENT),
        Err(RingError::Shutdown)
    );
}

/// Two threads, a million minimal fragments, strict FIFO and no lost slots.
#[test]
fn spsc_fifo_one_million_fragments() {
    const COUNT: i32 = 1_000_000;
    let (mut producer, mut consumer) = DualRing::with_bits(7, 6).split();
    producer.set_batch_publish(8);
    consumer.set_batch_release(8);

    let writer = std::thread::spawn(move || {
        for value in 0..COUNT {
            producer.begin_fragment(0, MIN_FRAGMENT).unwrap();
            producer.write_int(value);
            producer.end_fragment();
        }
        producer.publish_eof().unwrap();
    });

    let mut next = 0;
    loop {
        let Some(idx) = consumer.try_peek() else {
            std::thread::yield_now();
            continue;
        };
        if RingConsumer::is_eof(idx) {
            break;
        }
        if !consumer.begin_fragment(MIN_FRAGMENT) {
            std::thread::yield_now();
            continue;
        }
        assert_eq!(consumer.read_int(), next, "fragments reordered or lost");
        consumer.release_fragment();
        next += 1;
    }
    assert_eq!(next, COUNT);
    writer.join().unwrap();
}
