use std::fmt::Write as _;

use agrobus::can::canid;
use pretty_assertions::assert_eq;

const SENDER: u8 = 0x81;
const RECEIVER: u8 = 0x26;

fn etpcat() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::new(env!("CARGO_BIN_EXE_etpcat"));
    cmd.arg("--log-level=TRACE");
    cmd
}

fn candump_line(dump: &mut String, index: u32, id: u32, data: &[u8]) {
    let seconds = index as f64 * 0.001;
    writeln!(
        dump,
        "({seconds:.6}) can0 {}#{}",
        hex::encode_upper(id.to_be_bytes()),
        hex::encode_upper(data)
    )
    .unwrap();
}

/// A full 1786-byte transfer as a candump would record it: both sides' control traffic plus all
/// 256 data frames
fn recorded_transfer() -> (String, Vec<u8>) {
    let payload: Vec<u8> = (0..1786).map(|i| (i % 251) as u8).collect();
    let cm_to_receiver = canid(7, 0xC800, RECEIVER, SENDER);
    let cm_to_sender = canid(7, 0xC800, SENDER, RECEIVER);
    let dt = canid(7, 0xC700, RECEIVER, SENDER);

    let mut dump = String::new();
    let mut index = 0;
    let mut line = |dump: &mut String, id: u32, data: &[u8]| {
        candump_line(dump, index, id, data);
        index += 1;
    };

    // RTS announcing 1786 bytes of PGN 0xE700
    line(&mut dump, cm_to_receiver, &[0x14, 0xFA, 0x06, 0, 0, 0, 0xE7, 0]);
    // The real receiver's CTS for the first 255 packets
    line(&mut dump, cm_to_sender, &[0x15, 0xFF, 0x01, 0, 0, 0, 0xE7, 0]);
    line(&mut dump, cm_to_receiver, &[0x16, 0xFF, 0x00, 0, 0, 0, 0xE7, 0]);
    for packet in 1..=255usize {
        let start = (packet - 1) * 7;
        let mut data = vec![packet as u8];
        data.extend_from_slice(&payload[start..start + 7]);
        line(&mut dump, dt, &data);
    }
    // Second round for the final packet
    line(&mut dump, cm_to_sender, &[0x15, 0x01, 0x00, 0x01, 0, 0, 0xE7, 0]);
    line(&mut dump, cm_to_receiver, &[0x16, 0x01, 0x01, 0, 0, 0, 0xE7, 0]);
    let mut last = vec![0x01];
    last.extend_from_slice(&payload[1785..]);
    last.extend_from_slice(&[0xFF; 6]);
    line(&mut dump, dt, &last);
    // The real receiver's EOMA
    line(&mut dump, cm_to_sender, &[0x17, 0xFA, 0x06, 0, 0, 0, 0xE7, 0]);

    (dump, payload)
}

#[test]
fn test_reconstructs_recorded_transfer() {
    let (dump, payload) = recorded_transfer();

    let output = etpcat().write_stdin(dump).output().unwrap();
    eprint!("{}", String::from_utf8_lossy(&output.stderr));
    assert!(output.status.success());

    // The last data frame is line index 260, so the transfer completes at t = 260 ms
    let expected = format!(
        "timestamp_us,channel,priority,src,dst,pgn,size,data\n\
         260000,0,7,0x81,0x26,0xE700,1786,{}\n",
        hex::encode_upper(&payload)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout, expected);
}

#[test]
fn test_incomplete_transfer_produces_no_rows() {
    let (dump, _) = recorded_transfer();
    // Cut the log off in the middle of the first burst
    let truncated: String = dump.lines().take(100).map(|l| format!("{l}\n")).collect();

    let output = etpcat().write_stdin(truncated).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout, "");
}

#[test]
fn test_garbage_lines_are_skipped() {
    let (dump, payload) = recorded_transfer();
    let noisy = format!("this is not a frame\n{dump}also not a frame\n");

    let output = etpcat().write_stdin(noisy).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&hex::encode_upper(&payload)));
}
