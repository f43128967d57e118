//! Fixed-size kernel exec-event record and its decoded domain form.

/// Byte length of the kernel ABI record (§3 "Exec event (kernel ABI)").
pub const RAW_EVENT_SIZE: usize = 544;

const COMM_LEN: usize = 16;
const FILENAME_LEN: usize = 256;
const ARGV_LEN: usize = 256;

/// Decoded exec event: NUL-terminated byte fields trimmed to owned strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub filename: String,
    pub argv: String,
}

/// Decodes a raw 544-byte little-endian kernel record.
///
/// Returns `None` if `raw` is not exactly [`RAW_EVENT_SIZE`] bytes; the
/// caller is expected to log a warning and drop the sample (§4.8).
pub fn decode_exec_event(raw: &[u8]) -> Option<ExecEvent> {
    if raw.len() != RAW_EVENT_SIZE {
        return None;
    }

    let pid = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let ppid = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    let uid = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    let gid = u32::from_le_bytes(raw[12..16].try_into().unwrap());
    let comm = &raw[16..16 + COMM_LEN];
    let filename = &raw[16 + COMM_LEN..16 + COMM_LEN + FILENAME_LEN];
    let argv = &raw[16 + COMM_LEN + FILENAME_LEN..16 + COMM_LEN + FILENAME_LEN + ARGV_LEN];

    Some(ExecEvent {
        pid,
        ppid,
        uid,
        gid,
        comm: trim_field(comm),
        filename: trim_field(filename),
        argv: trim_field(argv),
    })
}

/// Encodes an [`ExecEvent`] into a 544-byte buffer, NUL-padding string
/// fields to their declared widths. Used by tests to exercise the
/// encode/decode round trip and by in-process test fixtures that drive the
/// ring-buffer reader without a live kernel.
pub fn encode_exec_event(event: &ExecEvent) -> Vec<u8> {
    let mut buf = vec![0u8; RAW_EVENT_SIZE];
    buf[0..4].copy_from_slice(&event.pid.to_le_bytes());
    buf[4..8].copy_from_slice(&event.ppid.to_le_bytes());
    buf[8..12].copy_from_slice(&event.uid.to_le_bytes());
    buf[12..16].copy_from_slice(&event.gid.to_le_bytes());
    write_field(&mut buf[16..16 + COMM_LEN], &event.comm);
    write_field(
        &mut buf[16 + COMM_LEN..16 + COMM_LEN + FILENAME_LEN],
        &event.filename,
    );
    write_field(
        &mut buf[16 + COMM_LEN + FILENAME_LEN..16 + COMM_LEN + FILENAME_LEN + ARGV_LEN],
        &event.argv,
    );
    buf
}

fn write_field(slot: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(slot.len());
    slot[..n].copy_from_slice(&bytes[..n]);
    for b in &mut slot[n..] {
        *b = 0;
    }
}

/// Bytes up to the first NUL, with trailing ASCII spaces stripped (§4.8).
fn trim_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let slice = &field[..end];
    let trimmed = slice
        .iter()
        .rposition(|&b| b != b' ')
        .map(|last| &slice[..=last])
        .unwrap_or(&[]);
    String::from_utf8_lossy(trimmed).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExecEvent {
        ExecEvent {
            pid: 1234,
            ppid: 1,
            uid: 1000,
            gid: 1000,
            comm: "sh".to_string(),
            filename: "/bin/sh".to_string(),
            argv: "/bin/sh -c echo hi".to_string(),
        }
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(decode_exec_event(&[0u8; 10]).is_none());
        assert!(decode_exec_event(&[0u8; RAW_EVENT_SIZE + 1]).is_none());
    }

    #[test]
    fn encode_decode_round_trip() {
        let event = sample();
        let raw = encode_exec_event(&event);
        assert_eq!(raw.len(), RAW_EVENT_SIZE);
        let decoded = decode_exec_event(&raw).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn strips_nul_padding_and_trailing_space() {
        let mut raw = vec![0u8; RAW_EVENT_SIZE];
        raw[16..16 + 5].copy_from_slice(b"sh  \0");
        let decoded = decode_exec_event(&raw).unwrap();
        assert_eq!(decoded.comm, "sh");
        assert!(!decoded.comm.contains('\0'));
        assert!(!decoded.comm.ends_with(' '));
    }

    #[test]
    fn empty_strings_are_valid() {
        let raw = vec![0u8; RAW_EVENT_SIZE];
        let decoded = decode_exec_event(&raw).unwrap();
        assert_eq!(decoded.filename, "");
        assert_eq!(decoded.argv, "");
    }
}
