use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use proptest::prelude::*;
use termcast_daemon::SafeStreamWriter;

const TITLE: &[u8] = b"\x1b]2;marker\x07";

fn segment() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z ]{1,6}",
        "[éß漢字🙂]{1,3}",
        Just("\n".to_string()),
        Just("\x1b[1;32m".to_string()),
        Just("\x1b[H".to_string()),
        Just("\x1b[K".to_string()),
        Just("\x1b7".to_string()),
        Just("\x1b]0;wïndow\x07".to_string()),
        Just("\x1b]2;multi\nline\x1b\\".to_string()),
        Just("\x1bP1$r0m\x1b\\".to_string()),
    ]
}

fn stream_and_cuts() -> impl Strategy<Value = (Vec<String>, Vec<usize>)> {
    prop::collection::vec(segment(), 1..20).prop_flat_map(|segments| {
        let len: usize = segments.iter().map(String::len).sum();
        (Just(segments), prop::collection::vec(0..=len, 0..10))
    })
}

fn split<'a>(bytes: &'a [u8], cuts: &[usize]) -> Vec<&'a [u8]> {
    let mut cuts = cuts.to_vec();
    cuts.sort_unstable();
    cuts.dedup();
    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        chunks.push(&bytes[start..cut]);
        start = cut;
    }
    chunks.push(&bytes[start..]);
    chunks
}

fn forward_all(chunks: &[&[u8]]) -> Vec<u8> {
    let writer = SafeStreamWriter::new(Duration::from_secs(60));
    let sink = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&sink);
    writer.attach(Box::new(move |bytes| {
        out.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }));
    writer.queue_title("marker");
    for chunk in chunks {
        writer.process_output(chunk).unwrap();
    }
    let forwarded = sink.lock().unwrap().clone();
    forwarded
}

fn find(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(i, _)| i)
        .collect()
}

proptest! {
    #[test]
    fn injected_title_never_splits_a_unit((segments, cuts) in stream_and_cuts()) {
        let stream = segments.concat();
        let forwarded = forward_all(&split(stream.as_bytes(), &cuts));

        prop_assert!(std::str::from_utf8(&forwarded).is_ok());

        let mut boundaries = vec![0];
        for segment in &segments {
            let last = boundaries.last().copied().unwrap_or(0);
            boundaries.push(last + segment.len());
        }

        // The stream itself never contains the marker title.
        let hits = find(&forwarded, TITLE);
        prop_assert!(hits.len() <= 1);
        match hits.first() {
            Some(&at) => {
                prop_assert!(boundaries.contains(&at), "title at {} splits a unit", at);
                let mut without = forwarded[..at].to_vec();
                without.extend_from_slice(&forwarded[at + TITLE.len()..]);
                prop_assert_eq!(without, stream.as_bytes().to_vec());
            }
            None => prop_assert_eq!(forwarded, stream.as_bytes().to_vec()),
        }
    }

    #[test]
    fn injection_point_does_not_depend_on_chunking((segments, cuts) in stream_and_cuts()) {
        let stream = segments.concat();
        let whole = forward_all(&[stream.as_bytes()]);
        let chunked = forward_all(&split(stream.as_bytes(), &cuts));
        prop_assert_eq!(whole, chunked);
    }
}
