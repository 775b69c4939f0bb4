// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// End-to-end repack scenarios over both dialects, asserted against the
// container's record stream.

mod common;

use apxtlm_repack::{repack_file, Dialect, RepackConfig};
use common::{parse, unqcompress, Rec};
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

fn repack_str(name: &str, content: &str, config: &RepackConfig) -> (Vec<u8>, PathBuf) {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join(name);
    let output = dir.path().join("out.apxtlm");
    fs::write(&input, content).expect("write fixture");
    repack_file(&input, &output, config).expect("repack");
    (fs::read(&output).expect("read output"), input)
}

#[test]
fn test_minimal_telemetry_stream() {
    let (bytes, _) = repack_str(
        "min.telemetry",
        "<telemetry><info time=\"1700000000000\"/><fields>a,b,c,d,e</fields>\
         <data><D t=\"100\">1,2,3,4,5</D><D t=\"200\">1,2,3,4,6</D></data></telemetry>",
        &RepackConfig::default(),
    );

    let (header, recs) = parse(&bytes);
    assert_eq!(header.version, 1);
    assert_eq!(header.start_timestamp, 1_700_000_000_000);
    assert_eq!(header.utc_offset, 0);

    // Info first, then the declaration burst in order.
    assert!(matches!(&recs[0], Rec::Jso { name, .. } if name == "info"));
    for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        assert_eq!(
            recs[1 + i],
            Rec::Field { name: (*name).to_owned(), aux: vec![] }
        );
    }

    assert_eq!(recs[6], Rec::Ts(100));
    for i in 0..5u16 {
        assert_eq!(
            recs[7 + i as usize],
            Rec::Sample { index: i, opt8: i != 0, half: true, value: (i + 1) as f32 }
        );
    }

    // Second row: indices 0..3 suppressed, index 4 re-emitted with
    // long framing right after the ts marker.
    assert_eq!(recs[12], Rec::Ts(200));
    assert_eq!(
        recs[13],
        Rec::Sample { index: 4, opt8: false, half: true, value: 6.0 }
    );
    assert_eq!(recs[14], Rec::Stop);
    assert_eq!(recs.len(), 15);
}

#[test]
fn test_datalink_seconds_timestamp() {
    let (bytes, _) = repack_str(
        "dump.datalink.xml",
        "<mandala time_ms=\"1700000000\"><S t=\"1\">1,2</S></mandala>",
        &RepackConfig::default(),
    );
    let (header, _) = parse(&bytes);
    assert_eq!(header.start_timestamp, 1_700_000_000_000);
}

#[test]
fn test_pre_2000_timestamp_falls_back_to_mtime() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("old.datalink.xml");
    let output = dir.path().join("out.apxtlm");
    fs::write(&input, "<mandala time_ms=\"946684799000\"><S t=\"1\">1,2</S></mandala>")
        .expect("write fixture");

    let mtime = fs::metadata(&input)
        .and_then(|m| m.modified())
        .expect("mtime")
        .duration_since(std::time::UNIX_EPOCH)
        .expect("epoch")
        .as_millis() as u64;

    repack_file(&input, &output, &RepackConfig::default()).expect("repack");
    let (header, _) = parse(&fs::read(&output).expect("read output"));
    assert_eq!(header.start_timestamp, mtime);
}

#[test]
fn test_uplink_burst_declares_then_suppresses() {
    let (bytes, _) = repack_str(
        "up.telemetry",
        "<telemetry><info time=\"1700000000000\"/><fields>a,b,c,d,e</fields><data>\
         <D t=\"1\">1,2,3,4,5</D>\
         <U><roll>1.5</roll><pitch>0.25</pitch></U>\
         <U><roll>1.5</roll><pitch>0.25</pitch></U>\
         </data></telemetry>",
        &RepackConfig::default(),
    );

    let (_, recs) = parse(&bytes);

    // After the downlink row: declaration then dir+sample, per child.
    let tail: Vec<&Rec> = recs
        .iter()
        .skip_while(|r| !matches!(r, Rec::Field { name, .. } if name == "roll"))
        .collect();
    assert_eq!(
        tail[0],
        &Rec::Field { name: "roll".to_owned(), aux: vec![] }
    );
    assert_eq!(tail[1], &Rec::Dir);
    assert_eq!(
        tail[2],
        &Rec::Sample { index: 5, opt8: true, half: true, value: 1.5 }
    );
    assert_eq!(
        tail[3],
        &Rec::Field { name: "pitch".to_owned(), aux: vec![] }
    );
    assert_eq!(tail[4], &Rec::Dir);
    assert_eq!(
        tail[5],
        &Rec::Sample { index: 6, opt8: true, half: true, value: 0.25 }
    );
    // The repeated burst adds nothing: values cached, fields known.
    assert_eq!(tail[6], &Rec::Stop);
}

#[test]
fn test_opt8_delta_framing_between_fields_5_and_7() {
    let (bytes, _) = repack_str(
        "delta.telemetry",
        "<telemetry><info time=\"1700000000000\"/>\
         <fields>a,b,c,d,e,f,g,h</fields><data>\
         <D t=\"100\">1,1,1,1,1,1,1,1</D>\
         <D t=\"200\">1,1,1,1,1,2,1,3</D>\
         </data></telemetry>",
        &RepackConfig::default(),
    );

    let (_, recs) = parse(&bytes);
    let after_ts200: Vec<&Rec> = recs
        .iter()
        .skip_while(|r| **r != Rec::Ts(200))
        .collect();

    assert_eq!(
        after_ts200[1],
        &Rec::Sample { index: 5, opt8: false, half: true, value: 2.0 }
    );
    // 5 -> 7 is a single-byte head with delta 1.
    assert_eq!(
        after_ts200[2],
        &Rec::Sample { index: 7, opt8: true, half: true, value: 3.0 }
    );
}

#[test]
fn test_info_payload_contents() {
    let (bytes, input) = repack_str(
        "flight_042.telemetry",
        "<telemetry><info time=\"1700000000000\"/><data/></telemetry>",
        &RepackConfig::default().utc_offset(10_800),
    );

    let (header, recs) = parse(&bytes);
    assert_eq!(header.utc_offset, 10_800);

    let Rec::Jso { name, packed } = &recs[0] else {
        panic!("first record must be the info JSO");
    };
    assert_eq!(name, "info");

    let value: serde_json::Value =
        serde_json::from_slice(&unqcompress(packed)).expect("info json");
    assert_eq!(value["title"], "flight_042");
    assert_eq!(value["import"]["format"], "telemetry");
    assert_eq!(
        value["import"]["name"],
        input.file_name().and_then(|n| n.to_str()).expect("name")
    );
    assert_eq!(value["utc_offset"], 10_800);
    assert_eq!(value["timestamp"], 1_700_000_000_000u64 as u32);
}

#[test]
fn test_node_dictionary_capture_normalization() {
    let (bytes, _) = repack_str(
        "nodes.telemetry",
        "<telemetry><info time=\"1700000000000\"/><fields>a,b,c,d,e</fields><data>\
         <nodes><node><info uid=\"01AB\"/><fields>\
         <field><name>alt</name><title>Altitude</title><struct><type>float</type></struct></field>\
         </fields></node></nodes>\
         <D t=\"1\">1,2,3,4,5</D></data></telemetry>",
        &RepackConfig::default().include_jso(true),
    );

    let (_, recs) = parse(&bytes);
    let jso: Vec<_> = recs
        .iter()
        .filter_map(|r| match r {
            Rec::Jso { name, packed } => Some((name.clone(), packed.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(jso.len(), 2);
    assert_eq!(jso[0].0, "info");
    assert_eq!(jso[1].0, "nodes");

    let value: serde_json::Value =
        serde_json::from_slice(&unqcompress(&jso[1].1)).expect("nodes json");
    assert_eq!(value["nodes"][0]["dict"]["fields"][0]["name"], "alt");
    assert_eq!(value["nodes"][0]["dict"]["fields"][0]["type"], "float");
    assert_eq!(value["nodes"][0]["time"], 1_700_000_000_000u64);

    // The capture must not disturb the surrounding record stream.
    assert!(recs.contains(&Rec::Ts(1)));
    assert_eq!(*recs.last().expect("records"), Rec::Stop);
}

#[test]
fn test_dialect_classification_end_to_end() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("content_only.xml");
    fs::write(&input, "<telemetry><info time=\"1700000000000\"/><data/></telemetry>")
        .expect("write fixture");

    let stats = repack_file(&input, &dir.path().join("o.apxtlm"), &RepackConfig::default())
        .expect("repack");
    assert_eq!(stats.dialect, Dialect::Telemetry);
}
