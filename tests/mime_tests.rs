//! Integration tests for the multipart parser, part stashing and body rebuild.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use mimetrust::config::MimeConfig;
use mimetrust::error::MimeError;
use mimetrust::mime::{
    ContentTypeHeader, FileStash, HybridStash, MemoryStash, MimeBody, StashManager, TransferEncoding,
};

const SOAP_CT: &str =
    "multipart/related; boundary=MIMEBoundary_1; type=\"application/soap+xml\"; start=\"<root.message@example.org>\"";

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn open_fixture(name: &str, content_type: &str, stash: Box<dyn StashManager>) -> MimeBody {
    let source = BufReader::new(File::open(fixture(name)).unwrap());
    MimeBody::new(stash, ContentTypeHeader::create(content_type), source, MimeConfig::default()).unwrap()
}

fn open_bytes(data: &[u8], content_type: &str, config: MimeConfig) -> Result<MimeBody, MimeError> {
    MimeBody::new(
        Box::new(MemoryStash::new()),
        ContentTypeHeader::create(content_type),
        Cursor::new(data.to_vec()),
        config,
    )
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

/// Reader that yields some bytes, then fails.
struct FailingReader {
    sent: bool,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.sent {
            self.sent = true;
            buf[..4].copy_from_slice(b"part");
            return Ok(4);
        }
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection dropped"))
    }
}

// ─── Test 1: Sequential access discovers every part, then stops ─────

#[test]
fn test_sequential_parts_then_no_more() {
    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));
    assert!(body.is_multipart());
    assert_eq!(body.boundary(), Some("MIMEBoundary_1"));

    for ordinal in 0..3 {
        assert_eq!(body.part(ordinal).unwrap().ordinal(), ordinal);
    }
    // Still inside the last part's body: the closing boundary is not seen yet.
    assert!(body.is_more_parts_possible());
    assert!(matches!(
        body.part(3),
        Err(MimeError::NoSuchPart { ordinal: Some(3), .. })
    ));
    assert!(!body.is_more_parts_possible());
    assert!(!body.has_part(3).unwrap());
}

// ─── Test 2: Root part headers and lookup by Content-ID ─────────────

#[test]
fn test_root_part_and_content_id_lookup() {
    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));
    let root = body.first_part();
    assert!(root.content_type().is_soap12());
    assert_eq!(root.content_id(true), Some("root.message@example.org"));

    let attachment = body.part_by_content_id("<att1@example.org>").unwrap();
    assert_eq!(attachment.ordinal(), 1);
    assert_eq!(attachment.transfer_encoding(), TransferEncoding::Base64);
}

// ─── Test 3: Base64 part is decoded, raw mode keeps it encoded ──────

#[test]
fn test_attachment_decoding() {
    let expected = std::fs::read(fixture("attachment.bin")).unwrap();

    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));
    assert_eq!(body.part_body_bytes(1).unwrap(), expected);

    let raw_config = MimeConfig {
        raw_parts: true,
        ..MimeConfig::default()
    };
    let source = BufReader::new(File::open(fixture("soap_with_attachment.mime")).unwrap());
    let mut raw = MimeBody::new(
        Box::new(MemoryStash::new()),
        ContentTypeHeader::create(SOAP_CT),
        source,
        raw_config,
    )
    .unwrap();
    let encoded = raw.part_body_bytes(1).unwrap();
    assert_ne!(encoded, expected);
    assert_eq!(TransferEncoding::Base64.decode(&encoded).unwrap(), expected);
}

// ─── Test 4: Unmodified body rebuilds byte for byte ─────────────────

#[test]
fn test_entire_body_round_trip() {
    let original = std::fs::read(fixture("soap_with_attachment.mime")).unwrap();
    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));

    // Touch a middle part first so the rebuild mixes stashed and fresh data.
    body.part(1).unwrap();
    let length = body.entire_message_body_length().unwrap();

    let mut rebuilt = Vec::new();
    body.entire_message_body(false)
        .unwrap()
        .read_to_end(&mut rebuilt)
        .unwrap();
    assert_eq!(rebuilt, original);
    assert_eq!(length, original.len() as u64);
}

// ─── Test 5: Content-Length mismatch on a later part ────────────────

#[test]
fn test_content_length_mismatch_names_both_sizes() {
    let mut body = open_fixture("bad_length.mime", "multipart/mixed; boundary=MIMEBoundary_1", Box::new(MemoryStash::new()));
    assert_eq!(body.part_body_bytes(0).unwrap(), b"first");

    let err = body.part_body_bytes(1).unwrap_err();
    assert!(matches!(
        err,
        MimeError::ContentLengthMismatch { ordinal: 1, declared: 3, actual: 6 }
    ));
    let message = err.to_string();
    assert!(message.contains('3') && message.contains('6'), "{message}");
}

#[test]
fn test_matching_content_length_is_accepted() {
    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));
    assert_eq!(body.part_body_bytes(2).unwrap(), b"hello world");
    assert_eq!(body.part_content_length(2).unwrap(), Some(11));
}

// ─── Test 6: Single-part body ───────────────────────────────────────

#[test]
fn test_single_part_xml() {
    let mut body = open_fixture("single.xml", "text/xml; charset=utf-8", Box::new(MemoryStash::new()));
    assert!(!body.is_multipart());
    assert!(body.first_part().content_type().is_xml());
    assert_eq!(body.part_body_bytes(0).unwrap(), b"<a/>");
    assert_eq!(body.part_content_length(0).unwrap(), Some(4));
    assert!(body.part(1).is_err());
}

// ─── Test 7: Stash queries do not change stash state ────────────────

#[test]
fn test_peek_and_size_are_idempotent() {
    let mut stash = MemoryStash::new();
    stash.stash(0, &mut &b"abc"[..]).unwrap();
    for _ in 0..5 {
        assert!(stash.peek(0));
        assert_eq!(stash.size(0), Some(3));
        assert!(!stash.peek(1));
        assert_eq!(stash.size(1), None);
    }
    stash.unstash(0);
    assert!(!stash.peek(0));
    assert_eq!(stash.size(0), None);
}

// ─── Test 8: A failed stash replays its error ───────────────────────

#[test]
fn test_failed_stash_is_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let stashes: Vec<Box<dyn StashManager>> = vec![
        Box::new(MemoryStash::new()),
        Box::new(FileStash::new(dir.path(), "fail").unwrap()),
    ];
    for mut stash in stashes {
        assert!(stash.stash(0, &mut FailingReader { sent: false }).is_err());
        assert!(stash.peek(0));
        assert_eq!(stash.size(0), None);
        let first = stash.recall_bytes(0).unwrap_err().to_string();
        let second = stash.recall_bytes(0).unwrap_err().to_string();
        assert_eq!(first, second);
        assert!(first.contains("connection dropped"), "{first}");

        stash.stash(0, &mut &b"retry"[..]).unwrap();
        assert_eq!(&stash.recall_bytes(0).unwrap()[..], b"retry");
        stash.close();
    }
}

// ─── Test 9: Hybrid stash spills once, past its limit ───────────────

#[test]
fn test_hybrid_stash_spills_past_limit() {
    let dir = tempfile::tempdir().unwrap();
    let root_len = {
        let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));
        body.part_actual_content_length(0).unwrap()
    };

    let stash = HybridStash::new(root_len, dir.path(), "hybrid");
    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(stash));

    body.part(1).unwrap();
    assert_eq!(file_count(dir.path()), 0, "root part fits in memory");

    body.read_and_stash_entire_message().unwrap();
    // The crossing part and every later one go to disk.
    assert_eq!(file_count(dir.path()), 2);
    assert!(body.stash_manager().is_byte_array_available(0));
    assert!(!body.stash_manager().is_byte_array_available(2));
    assert_eq!(body.part_body_bytes(2).unwrap(), b"hello world");

    body.close();
    assert_eq!(file_count(dir.path()), 0);
}

// ─── Test 10: Destructive read of the current part ──────────────────

#[test]
fn test_destructive_read_cannot_be_repeated() {
    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));
    let mut root = Vec::new();
    body.part_input_stream(0, true)
        .unwrap()
        .read_to_end(&mut root)
        .unwrap();
    assert!(root.starts_with(b"<?xml"));
    assert!(body.first_part().is_body_read());
    assert!(!body.is_body_available(0));
    assert!(matches!(
        body.part_body_bytes(0),
        Err(MimeError::Destroyed { ordinal: 0 })
    ));
    assert!(matches!(
        body.entire_message_body(false).err(),
        Some(MimeError::Destroyed { ordinal: 0 })
    ));
}

// ─── Test 11: Replacing a part body re-encodes it ───────────────────

#[test]
fn test_replaced_attachment_round_trips() {
    let mut body = open_fixture("soap_with_attachment.mime", SOAP_CT, Box::new(MemoryStash::new()));
    body.set_part_body_bytes(1, b"replacement").unwrap();
    assert_eq!(body.part_body_bytes(1).unwrap(), b"replacement");

    let mut rebuilt = Vec::new();
    body.entire_message_body(false)
        .unwrap()
        .read_to_end(&mut rebuilt)
        .unwrap();
    let text = String::from_utf8(rebuilt).unwrap();
    assert!(text.contains("cmVwbGFjZW1lbnQ="));
    assert!(text.contains("hello world"));
}

// ─── Test 12: Boundary-like text inside a body is data ──────────────

#[test]
fn test_boundary_prefix_in_body_is_kept() {
    let data = b"--b\r\nContent-Type: text/plain\r\n\r\nline\r\n--bx not a boundary\r\n--b--\r\n";
    let mut body = open_bytes(data, "multipart/mixed; boundary=b", MimeConfig::default()).unwrap();
    assert_eq!(body.part_body_bytes(0).unwrap(), b"line\r\n--bx not a boundary");
    assert!(!body.has_part(1).unwrap());
}

// ─── Test 13: Boundary length limit ─────────────────────────────────

#[test]
fn test_overlong_boundary_is_rejected() {
    // With the leading dashes this is one byte over the limit.
    let boundary = "x".repeat(4095);
    let data = format!("--{boundary}\r\n\r\nbody\r\n--{boundary}--\r\n");
    let content_type = format!("multipart/mixed; boundary={boundary}");
    let err = open_bytes(data.as_bytes(), &content_type, MimeConfig::default()).err();
    assert!(matches!(err, Some(MimeError::Parse(_))), "{err:?}");

    let boundary = "x".repeat(4094);
    let data = format!("--{boundary}\r\n\r\nbody\r\n--{boundary}--\r\n");
    let content_type = format!("multipart/mixed; boundary={boundary}");
    let mut body = open_bytes(data.as_bytes(), &content_type, MimeConfig::default()).unwrap();
    assert_eq!(body.part_body_bytes(0).unwrap(), b"body");
}

// ─── Test 14: Oversized part headers poison the whole body ──────────

#[test]
fn test_oversized_headers_latch_error() {
    let long = "v".repeat(256);
    let data = format!(
        "--b\r\nContent-Type: text/plain\r\n\r\nfirst\r\n--b\r\nX-Long: {long}\r\n\r\nsecond\r\n--b--\r\n"
    );
    let config = MimeConfig {
        headers_max_size: 128,
        ..MimeConfig::default()
    };
    let mut body = open_bytes(data.as_bytes(), "multipart/mixed; boundary=b", config).unwrap();
    let first = body.part(1).unwrap_err().to_string();
    let again = body.part(0).unwrap_err().to_string();
    assert_eq!(first, again);
    assert!(body.part_body_bytes(0).is_err());
}
