//! Whole-pipe round trips: host fragments -> encoder -> bytes -> decoder
//! -> fragments, compared value for value, and decoded streams re-encoded
//! byte for byte.

use fast_codec::catalog::{Catalog, CatalogBuilder};
use fast_codec::{
    absent_int32, absent_int64, CodecConfig, CodecError, DecodeReactor, EncodeReactor,
    MessageWriter, ShutdownFlag, SliceSource, VecSink, Violation,
};
use fast_ring::{DualRing, RingConsumer};
use fast_token::{GroupFlags, TypeTag};

const EXAMPLE_XML: &[u8] = include_bytes!("../templates/example.xml");

fn example_catalog() -> Catalog {
    CatalogBuilder::new().load_xml(EXAMPLE_XML).unwrap()
}

fn wide_config() -> CodecConfig {
    CodecConfig {
        slab_bits: 16,
        blob_bits: 16,
        ..CodecConfig::default()
    }
}

/// A field value as seen through the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    I32(Option<i32>),
    I64(Option<i64>),
    Dec(Option<(i32, i64)>),
    Text(Option<Vec<u8>>),
    SeqLen(Option<u32>),
}

/// One message: wire template id plus its field values in script order
/// (sequence bodies flattened iteration by iteration).
type Message = (i64, Vec<Value>);

/// Push `messages` through a MessageWriter and encode them to bytes.
fn encode(catalog: &Catalog, config: &CodecConfig, messages: &[Message]) -> Vec<u8> {
    let (producer, consumer) = DualRing::with_bits(config.slab_bits, config.blob_bits).split();
    let mut writer = MessageWriter::new(catalog, config, producer);
    for (template_id, values) in messages {
        writer.begin_message(*template_id, 0).unwrap();
        for value in values {
            match value {
                Value::I32(v) => writer.write_int32(*v).unwrap(),
                Value::I64(v) => writer.write_int64(*v).unwrap(),
                Value::Dec(v) => writer.write_decimal(*v).unwrap(),
                Value::Text(v) => writer.write_text(v.as_deref()).unwrap(),
                Value::SeqLen(v) => writer.write_sequence_len(*v).unwrap(),
            }
        }
        assert!(writer.message_done(), "script not fully written");
    }
    writer.publish_eof().unwrap();

    let mut encoder = EncodeReactor::new(
        catalog,
        config,
        VecSink::new(),
        consumer,
        ShutdownFlag::new(),
    );
    let encoded = encoder.run().unwrap();
    assert_eq!(encoded as usize, messages.len());
    encoder.into_sink().into_bytes()
}

/// Decode bytes into a ring and hand back its consumer half.
fn decode(
    catalog: &Catalog,
    config: &CodecConfig,
    bytes: &[u8],
) -> Result<(u64, RingConsumer), CodecError> {
    let (producer, consumer) = DualRing::with_bits(config.slab_bits, config.blob_bits).split();
    let mut reactor = DecodeReactor::new(
        catalog,
        config,
        SliceSource::new(bytes),
        producer,
        ShutdownFlag::new(),
    );
    let count = reactor.run()?;
    Ok((count, consumer))
}

/// Walk one decoded message off the ring, mirroring the script structure.
fn read_message(catalog: &Catalog, consumer: &mut RingConsumer) -> Option<Message> {
    let idx = consumer.try_peek()?;
    if RingConsumer::is_eof(idx) {
        return None;
    }
    let start = idx as usize;
    let template_id = i64::from(catalog.template_at(start).expect("message head").id);
    let mut values = Vec::new();
    let mut stack: Vec<(usize, usize, u32)> = Vec::new();
    let mut frag = start;
    loop {
        assert!(
            consumer.begin_fragment(catalog.fragment_slots(frag)),
            "fragment at {frag} not fully published"
        );
        let end = frag + catalog.fragment_script_len(frag);
        let mut pos = frag;
        let mut seq: Option<(usize, u32)> = None;
        let mut closed_template = false;
        let mut closed_body = false;
        while pos < end {
            let token = catalog.token(pos);
            match token.type_tag() {
                TypeTag::Group => {
                    let flags = token.group_flags();
                    if flags.contains(GroupFlags::CLOSE) {
                        if flags.contains(GroupFlags::TEMPLATE) {
                            closed_template = true;
                        } else if catalog.is_body_open(pos - token.instance() as usize) {
                            closed_body = true;
                        }
                    }
                    pos += 1;
                }
                TypeTag::Dictionary => pos += 1,
                TypeTag::GroupLength => {
                    let raw = consumer.read_int();
                    let len = (raw != absent_int32(token)).then_some(raw as u32);
                    values.push(Value::SeqLen(len));
                    seq = Some((pos + 1, len.unwrap_or(0)));
                    pos += 1;
                }
                TypeTag::Int32 => {
                    let raw = consumer.read_int();
                    values.push(Value::I32((raw != absent_int32(token)).then_some(raw)));
                    pos += 1;
                }
                TypeTag::Int64 => {
                    let raw = consumer.read_long();
                    values.push(Value::I64((raw != absent_int64(token)).then_some(raw)));
                    pos += 1;
                }
                TypeTag::Decimal => {
                    let (exp, mant) = consumer.read_decimal();
                    values.push(Value::Dec(
                        (exp != absent_int32(token)).then_some((exp, mant)),
                    ));
                    pos += 2;
                }
                TypeTag::Ascii | TypeTag::Utf8 | TypeTag::ByteVec => {
                    let (meta, len) = consumer.read_bytes_meta();
                    if RingConsumer::is_null_bytes(len) {
                        values.push(Value::Text(None));
                    } else if meta < 0 {
                        let constant = catalog.constant((-meta - 1) as usize).to_vec();
                        values.push(Value::Text(Some(constant)));
                    } else {
                        let mut bytes = Vec::new();
                        consumer.blob_bytes(meta, len as usize).copy_to(&mut bytes);
                        values.push(Value::Text(Some(bytes)));
                    }
                    pos += 1;
                }
            }
        }
        consumer.release_fragment();

        if let Some((body_open, count)) = seq {
            let body_close = body_open + catalog.token(body_open).instance() as usize;
            stack.push((body_open, body_close, count));
        } else {
            debug_assert!(closed_template || closed_body);
        }
        if closed_template {
            return Some((template_id, values));
        }
        // Resolve the next fragment in the chain.
        loop {
            match stack.last_mut() {
                None => {
                    unreachable!("chain continues without a frame");
                }
                Some((body_open, _, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    frag = *body_open;
                    break;
                }
                Some((_, body_close, _)) => {
                    let after = *body_close + 1;
                    stack.pop();
                    let next = catalog.token(after);
                    if next.type_tag() == TypeTag::Group
                        && next.group_flags().contains(GroupFlags::CLOSE)
                    {
                        if next.group_flags().contains(GroupFlags::TEMPLATE) {
                            return Some((template_id, values));
                        }
                        continue;
                    }
                    frag = after;
                    break;
                }
            }
        }
    }
}

fn read_all(catalog: &Catalog, consumer: &mut RingConsumer) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Some(message) = read_message(catalog, consumer) {
        messages.push(message);
    }
    messages
}

fn heartbeat(interval: i32) -> Message {
    (1, vec![Value::I32(Some(interval))])
}

fn md_entry(action: i32, px: i64, size: Option<i64>, quote: &[u8]) -> Vec<Value> {
    vec![
        Value::I32(Some(action)),                   // MDUpdateAction
        Value::I32(Some(1)),                        // MDPriceLevel
        Value::Text(Some(b"2".to_vec())),           // MDEntryType
        Value::I32(None),                           // OpenCloseSettleFlag
        Value::Text(Some(b"8".to_vec())),           // SecurityIDSource (constant)
        Value::I32(Some(100_001)),                  // SecurityID
        Value::I32(Some(9)),                        // RptSeq
        Value::Dec(Some((-2, px))),                 // MDEntryPx
        Value::Dec(size.map(|m| (0, m))),           // MDEntrySize
        Value::Dec(None),                           // NetChgPrevDay
        Value::I32(Some(34_200_000)),               // MDEntryTime
        Value::I32(None),                           // AggressorSide
        Value::Text(Some(quote.to_vec())),          // QuoteCondition
        Value::Text(Some(b"2".to_vec())),           // TradingSessionID
        Value::I64(Some(12)),                       // NumberOfOrders
        Value::I32(Some(1)),                        // MDEntryPositionNo
    ]
}

fn md_message(seq_num: i32, entries: &[Vec<Value>]) -> Message {
    let mut values = vec![
        Value::Text(Some(b"8".to_vec())),           // ApplVerID (constant)
        Value::Text(Some(b"X".to_vec())),           // MessageType (constant)
        Value::Text(Some(b"CME".to_vec())),         // SenderCompID
        Value::I32(Some(seq_num)),                  // MsgSeqNum
        Value::I64(Some(20_260_801_093_000)),       // SendingTime
        Value::I32(Some(20_260_801)),               // TradeDate
        Value::I32(Some(2)),                        // MarketDepth
        Value::Text(Some(vec![0xDE, 0xAD, 0xBE])),  // SecurityAltID
        Value::Text(Some("börse".as_bytes().to_vec())), // FreeText
        Value::SeqLen(Some(entries.len() as u32)),  // NoMDEntries
    ];
    for entry in entries {
        values.extend(entry.iter().cloned());
    }
    (2, values)
}

fn order_message(cl_ord_id: &[u8], price: Option<(i32, i64)>) -> Message {
    (
        99,
        vec![
            Value::Text(Some(b"D".to_vec())),       // MsgType (constant)
            Value::Text(Some(cl_ord_id.to_vec())),  // ClOrdID
            Value::Text(Some(b"ACC-7".to_vec())),   // Account
            Value::Text(Some(b"ESU6".to_vec())),    // Symbol
            Value::I32(Some(1)),                    // Side
            Value::Dec(Some((0, 250))),             // OrderQty
            Value::Dec(price),                      // Price
            Value::Text(Some(b"2".to_vec())),       // OrdType
            Value::I32(Some(0)),                    // TimeInForce
            Value::I64(Some(20_260_801_093_001)),   // TransactTime
            Value::I32(None),                       // MinQty
            Value::I32(Some(20_260_815)),           // ExpireDate
            Value::Text(Some(b"CS".to_vec())),      // SecurityType
            Value::Text(Some(b"1".to_vec())),       // HandlInst
        ],
    )
}

fn assert_round_trip(messages: &[Message]) -> Vec<u8> {
    let catalog = example_catalog();
    let config = wide_config();
    let bytes = encode(&catalog, &config, messages);
    let (count, mut consumer) = decode(&catalog, &config, &bytes).unwrap();
    assert_eq!(count as usize, messages.len());
    let decoded = read_all(&catalog, &mut consumer);
    assert_eq!(decoded, messages);
    bytes
}

#[test]
fn heartbeat_round_trip() {
    assert_round_trip(&[heartbeat(30), heartbeat(30), heartbeat(45)]);
}

#[test]
fn market_data_round_trip_with_sequence() {
    let m1 = md_message(
        7,
        &[
            md_entry(0, 150_025, Some(40), b"A"),
            md_entry(1, 150_050, None, b"B"),
        ],
    );
    let m2 = md_message(8, &[md_entry(1, 150_075, Some(41), b"B")]);
    assert_round_trip(&[m1, m2]);
}

#[test]
fn empty_sequence_round_trip() {
    assert_round_trip(&[md_message(1, &[]), md_message(2, &[])]);
}

#[test]
fn order_round_trip_with_optional_decimal() {
    assert_round_trip(&[
        order_message(b"ORD-1", Some((-2, 987_654))),
        order_message(b"ORD-2", None),
        order_message(b"ORD-3", Some((-2, 987_660))),
    ]);
}

#[test]
fn mixed_stream_observes_expected_message_indices() {
    let catalog = example_catalog();
    let config = wide_config();
    let messages = vec![
        heartbeat(30),
        md_message(1, &[md_entry(0, 1000, Some(5), b"A")]),
        order_message(b"ORD-9", None),
        heartbeat(30),
    ];
    let bytes = encode(&catalog, &config, &messages);
    let (_, mut consumer) = decode(&catalog, &config, &bytes).unwrap();
    // Message-head indices are exactly the template start offsets.
    let mut heads = Vec::new();
    while let Some(idx) = consumer.try_peek() {
        if RingConsumer::is_eof(idx) {
            break;
        }
        heads.push(idx);
        let message = read_message(&catalog, &mut consumer);
        assert!(message.is_some());
    }
    assert_eq!(heads, [0, 3, 36, 0]);
    for head in heads {
        assert!([0, 3, 36].contains(&head));
    }
}

/// A decoded stream re-encodes to the identical byte sequence: the two
/// operator matrices agree bit for bit, including dictionary evolution.
#[test]
fn re_encode_is_byte_identical() {
    let catalog = example_catalog();
    let config = wide_config();
    let messages = vec![
        md_message(
            1,
            &[
                md_entry(0, 150_025, Some(40), b"A"),
                md_entry(1, 150_030, Some(41), b"A"),
                md_entry(2, 150_035, None, b"C"),
            ],
        ),
        md_message(2, &[md_entry(0, 150_040, Some(44), b"C")]),
        order_message(b"ORD-1", Some((-2, 987_654))),
        order_message(b"ORD-11", Some((-2, 987_600))),
        heartbeat(60),
    ];
    let first = encode(&catalog, &config, &messages);

    // Decode into a ring, then run the encoder straight off that ring.
    let (producer, consumer) = DualRing::with_bits(config.slab_bits, config.blob_bits).split();
    let mut reactor = DecodeReactor::new(
        &catalog,
        &config,
        SliceSource::new(&first),
        producer,
        ShutdownFlag::new(),
    );
    reactor.run().unwrap();
    let mut encoder = EncodeReactor::new(
        &catalog,
        &config,
        VecSink::new(),
        consumer,
        ShutdownFlag::new(),
    );
    encoder.run().unwrap();
    let second = encoder.into_sink().into_bytes();
    assert_eq!(second.len(), first.len());
    assert_eq!(second, first);
}

/// Copy state written while decoding message N is what message N+1's
/// PMap-0 path reads: dictionary writes are visible across fragments in
/// order, never early.
#[test]
fn dictionary_state_carries_across_messages() {
    let catalog = example_catalog();
    let config = wide_config();
    // Identical orders: the second compresses to almost nothing but must
    // decode to the same values.
    let m = order_message(b"ORD-5", Some((-2, 1_000)));
    let bytes = encode(&catalog, &config, &[m.clone(), m.clone(), m.clone()]);
    let (_, mut consumer) = decode(&catalog, &config, &bytes).unwrap();
    let decoded = read_all(&catalog, &mut consumer);
    assert_eq!(decoded, vec![m.clone(), m.clone(), m]);
}

#[test]
fn truncated_stream_reports_template_and_offset() {
    let catalog = example_catalog();
    let config = wide_config();
    let messages = vec![
        md_message(1, &[md_entry(0, 1000, Some(5), b"A")]),
        md_message(2, &[md_entry(1, 1010, Some(6), b"B")]),
    ];
    let bytes = encode(&catalog, &config, &messages);
    // Cut inside the second message.
    let cut = bytes.len() - 3;
    match decode(&catalog, &config, &bytes[..cut]) {
        Err(CodecError::UnexpectedEndOfStream(context)) => {
            assert_eq!(context.template_id, Some(2));
            assert!(context.byte_offset.is_some());
        }
        other => panic!("expected truncation error, got {other:?}"),
    }
}

#[test]
fn unknown_template_id_is_a_protocol_violation() {
    let catalog = example_catalog();
    let config = wide_config();
    // Template id 7 is not in the catalog.
    let bytes = [0x87u8];
    match decode(&catalog, &config, &bytes) {
        Err(CodecError::ProtocolViolation {
            violation: Violation::UnknownTemplate,
            ..
        }) => {}
        other => panic!("{other:?}"),
    }
}

#[test]
fn preamble_passes_through_verbatim() {
    let catalog = example_catalog();
    let config = CodecConfig {
        preamble_bytes: 4,
        ..wide_config()
    };

    let (producer, consumer) = DualRing::with_bits(config.slab_bits, config.blob_bits).split();
    let mut writer = MessageWriter::new(&catalog, &config, producer);
    writer.begin_message(1, 0x4641_5354).unwrap();
    writer.write_int32(Some(30)).unwrap();
    assert!(writer.message_done());
    writer.publish_eof().unwrap();

    let mut encoder = EncodeReactor::new(
        &catalog,
        &config,
        VecSink::new(),
        consumer,
        ShutdownFlag::new(),
    );
    encoder.run().unwrap();
    let bytes = encoder.into_sink().into_bytes();
    assert_eq!(&bytes[..4], b"FAST");

    let (producer, mut consumer) = DualRing::with_bits(config.slab_bits, config.blob_bits).split();
    let mut reactor = DecodeReactor::new(
        &catalog,
        &config,
        SliceSource::new(&bytes),
        producer,
        ShutdownFlag::new(),
    );
    reactor.run().unwrap();
    assert!(consumer.begin_fragment(catalog.fragment_slots(0) + 1));
    assert_eq!(consumer.read_int(), 0x4641_5354);
    assert_eq!(consumer.read_int(), 30);
    consumer.release_fragment();
}

/// A long seeded-random stream over all three templates, round-tripped
/// at the value level and then re-encoded to the identical byte count.
#[test]
fn randomized_stream_is_stable() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let catalog = example_catalog();
    let config = wide_config();
    let mut rng = StdRng::seed_from_u64(0x5EED_FA57);
    let quotes: [&[u8]; 4] = [b"A", b"B", b"C", b"K"];
    let mut messages = Vec::new();
    let mut px = 150_000i64;
    for i in 0..40 {
        match rng.gen_range(0..3) {
            0 => messages.push(heartbeat(rng.gen_range(10..120))),
            1 => {
                let entries: Vec<_> = (0..rng.gen_range(0..4))
                    .map(|_| {
                        px += rng.gen_range(-50..50);
                        let size = rng.gen_bool(0.7).then(|| rng.gen_range(1..500));
                        md_entry(rng.gen_range(0..3), px, size, quotes[rng.gen_range(0..4)])
                    })
                    .collect();
                messages.push(md_message(i, &entries));
            }
            _ => {
                let price = rng
                    .gen_bool(0.8)
                    .then(|| (-2, px + rng.gen_range(-100..100)));
                messages.push(order_message(format!("ORD-{i}").as_bytes(), price));
            }
        }
    }

    let first = encode(&catalog, &config, &messages);
    let (count, mut consumer) = decode(&catalog, &config, &first).unwrap();
    assert_eq!(count as usize, messages.len());
    assert_eq!(read_all(&catalog, &mut consumer), messages);

    let (producer, consumer) = DualRing::with_bits(config.slab_bits, config.blob_bits).split();
    let mut reactor = DecodeReactor::new(
        &catalog,
        &config,
        SliceSource::new(&first),
        producer,
        ShutdownFlag::new(),
    );
    reactor.run().unwrap();
    let mut encoder = EncodeReactor::new(
        &catalog,
        &config,
        VecSink::new(),
        consumer,
        ShutdownFlag::new(),
    );
    encoder.run().unwrap();
    let second = encoder.into_sink().into_bytes();
    assert_eq!(second.len(), first.len());
}

/// Decoder and consumer on separate threads over a small ring: the
/// decode side must block on ring space without deadlocking or losing
/// fragments.
#[test]
fn threaded_pipe_with_tight_ring() {
    let catalog = example_catalog();
    let config = CodecConfig {
        slab_bits: 7,
        blob_bits: 10,
        ..CodecConfig::default()
    };
    let mut messages = Vec::new();
    for i in 0..500 {
        messages.push(heartbeat(30 + (i % 7)));
        messages.push(order_message(format!("ORD-{i}").as_bytes(), Some((-2, 1_000 + i64::from(i)))));
    }
    let bytes = encode(&catalog, &wide_config(), &messages);

    let (producer, mut consumer) = DualRing::with_bits(config.slab_bits, config.blob_bits).split();
    let expected = messages.clone();
    std::thread::scope(|scope| {
        let catalog_ref = &catalog;
        let config_ref = &config;
        let bytes_ref = &bytes;
        scope.spawn(move || {
            let mut reactor = DecodeReactor::new(
                catalog_ref,
                config_ref,
                SliceSource::new(bytes_ref),
                producer,
                ShutdownFlag::new(),
            );
            reactor.run().unwrap();
        });
        let mut seen = 0usize;
        loop {
            let Some(idx) = consumer.try_peek() else {
                std::thread::yield_now();
                continue;
            };
            if RingConsumer::is_eof(idx) {
                break;
            }
            match read_message(&catalog, &mut consumer) {
                Some(message) => {
                    assert_eq!(message, expected[seen]);
                    seen += 1;
                }
                None => break,
            }
        }
        assert_eq!(seen, expected.len());
    });
}
