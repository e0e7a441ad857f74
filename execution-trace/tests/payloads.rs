use exectrace::record::{
    ConcreteInput, Error, Fork, Origin, Record, RecordKind, TestCase, HEADER_SIZE,
};
use exectrace::TraceBuffer;

fn encode(case: &TestCase) -> Vec<u8> {
    let mut buffer = Vec::new();
    case.emit(&mut buffer).unwrap();
    buffer
}

#[test]
fn test_testcase_empty() {
    let case = TestCase::new(Vec::new());
    let bytes = encode(&case);
    assert!(bytes.is_empty());
    assert_eq!(TestCase::parse(&bytes).unwrap(), case);
}

#[test]
fn test_testcase_empty_name_and_data() {
    let case = TestCase::new(vec![ConcreteInput::new(Vec::new(), Vec::new())]);
    let bytes = encode(&case);
    assert_eq!(bytes, vec![0u8; 8]);

    let decoded = TestCase::parse(&bytes).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded.inputs()[0].name(), b"");
    assert_eq!(decoded.inputs()[0].data(), b"");
}

#[test]
fn test_testcase_binary_data() {
    let case = TestCase::new(vec![
        ConcreteInput::new(b"v0_argv_1".as_slice(), vec![0x00, 0xff, 0x80, 0x0a, 0x00]),
        ConcreteInput::new(b"v1_stdin".as_slice(), (0u8..=255).collect::<Vec<_>>()),
    ]);
    let bytes = encode(&case);
    let decoded = TestCase::parse(&bytes).unwrap();
    assert_eq!(decoded, case);

    let pairs: Vec<_> = decoded.iter().collect();
    assert_eq!(pairs[0].0, b"v0_argv_1");
    assert_eq!(pairs[0].1, &[0x00u8, 0xff, 0x80, 0x0a, 0x00]);
    assert_eq!(pairs[1].1.len(), 256);
}

#[test]
fn test_testcase_truncated_data() {
    let case = TestCase::new(vec![
        ConcreteInput::new(b"a".as_slice(), b"xyz".as_slice()),
        ConcreteInput::new(b"b".as_slice(), b"0123456789".as_slice()),
    ]);
    let mut bytes = encode(&case);
    bytes.truncate(bytes.len() - 4);
    let err = TestCase::parse(&bytes).unwrap_err();
    assert!(matches!(err.root(), Error::NotEnoughBytes));
}

#[test]
fn test_testcase_truncated_tuple_header() {
    let case = TestCase::new(vec![ConcreteInput::new(b"a".as_slice(), b"b".as_slice())]);
    let mut bytes = encode(&case);
    bytes.extend_from_slice(&[1, 0, 0]);
    let err = TestCase::parse(&bytes).unwrap_err();
    assert!(matches!(err.root(), Error::NotEnoughBytes));
}

#[test]
fn test_fork_payload_no_children() {
    let fork = Fork::new(0x8048000, Vec::new());
    let mut bytes = Vec::new();
    fork.emit(&mut bytes).unwrap();
    assert_eq!(bytes.len(), 12);
    assert_eq!(Fork::parse(&bytes).unwrap(), fork);
}

#[test]
fn test_fork_payload_many_children() {
    let children: Vec<u32> = (0..1000).map(|i| i * 7 + 3).collect();
    let fork = Fork::new(0x8048000, children.clone());
    let mut bytes = Vec::new();
    fork.emit(&mut bytes).unwrap();
    assert_eq!(bytes.len(), 12 + 4 * 1000);

    let decoded = Fork::parse(&bytes).unwrap();
    assert_eq!(decoded.pc(), 0x8048000);
    assert_eq!(decoded.children(), children.as_slice());
}

#[test]
fn test_records_in_trace() {
    let origin = Origin::new(100, 3, 0x2000);
    let mut trace = Vec::new();
    let case = TestCase::new(vec![ConcreteInput::new(b"x".as_slice(), vec![1u8, 2])]);
    Record::from(case.clone()).emit(origin, &mut trace).unwrap();
    Record::from(Fork::new(0x400, vec![4, 5]))
        .emit(origin, &mut trace)
        .unwrap();

    let records: Vec<_> = TraceBuffer::new(&trace)
        .iter()
        .map(|raw| {
            let header = raw.header().unwrap();
            assert_eq!(header.origin(), origin);
            raw.parse().unwrap().into_owned()
        })
        .collect();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0], Record::TestCase(case));
    assert_eq!(records[1].kind(), RecordKind::Fork);
    assert_eq!(trace.len(), 2 * HEADER_SIZE + (8 + 1 + 2) + (12 + 8));
}

#[test]
fn test_testcase_too_large_for_header() {
    let case = TestCase::new(vec![ConcreteInput::new(b"blob".as_slice(), vec![0u8; 300])]);
    let mut trace = Vec::new();
    let err = Record::from(case).emit(Origin::default(), &mut trace).unwrap_err();
    assert!(matches!(err.root(), Error::TooLarge { .. }));
    assert!(trace.is_empty());
}
