//! Shell stand-ins for the helper executables.
//!
//! Helpers run as `/bin/sh -c <script>` so no executable files are written.

#![allow(dead_code)]

use flim_daq::transport::ProcessTransport;
use std::time::Duration;

pub const SHELL: &str = "/bin/sh";

/// Photon counter helper: 2 channels x 4 bins, payload counts 0..8.
pub const COUNTER_HELPER: &str = r#"
echo "OK ready"
while IFS= read -r line; do
  set -- $line
  case "$1" in
    init) echo "OK" ;;
    reset) echo "OK" ;;
    info) echo "OK RES=25.0 CH=2 LEN=4" ;;
    acquire)
      echo "OK HIST CH=2 LEN=4 BYTES=32"
      echo "AAAAAAEAAAACAAAAAwAAAAQAAAAFAAAABgAAAAcAAAA=" ;;
    acquire_short)
      echo "OK HIST CH=2 LEN=4 BYTES=28"
      echo "AAAAAAEAAAACAAAAAwAAAAQAAAAFAAAABgAAAA==" ;;
    exit) echo "OK bye"; exit 0 ;;
    *) echo "ERR unknown_cmd $1" ;;
  esac
done
"#;

/// Counter helper that exits on its first `acquire` unless the marker file
/// named by `$1` exists, creating the marker as it goes.
pub const CRASH_ONCE_COUNTER_HELPER: &str = r#"
MARK="$1"
echo "OK ready"
while IFS= read -r line; do
  set -- $line
  case "$1" in
    init) echo "OK" ;;
    info) echo "OK RES=25.0 CH=2 LEN=4" ;;
    acquire)
      if [ ! -e "$MARK" ]; then : > "$MARK"; exit 3; fi
      echo "OK HIST CH=2 LEN=4 BYTES=32"
      echo "AAAAAAEAAAACAAAAAwAAAAQAAAAFAAAABgAAAAcAAAA=" ;;
    exit) echo "OK bye"; exit 0 ;;
    *) echo "ERR unknown_cmd $1" ;;
  esac
done
"#;

/// Detector helper reporting a constant intensity.
pub const DETECTOR_HELPER: &str = r#"
echo "OK ready"
while IFS= read -r line; do
  case "$line" in
    record) echo "OK VALUE=0.5" ;;
    exit) echo "OK bye"; exit 0 ;;
    *) echo "ERR unknown_cmd $line" ;;
  esac
done
"#;

/// Stage helper echoing the command it executed.
pub const STAGE_HELPER: &str = r#"
echo "OK ready"
while IFS= read -r line; do
  set -- $line
  case "$1" in
    open|move_ix|setdac|disable) echo "OK $line" ;;
    status) echo "OK X=1 Y=0" ;;
    exit) echo "OK bye"; exit 0 ;;
    *) echo "ERR unknown_cmd $1" ;;
  esac
done
"#;

/// Generic helper used by the transport tests.
pub const ECHO_HELPER: &str = r#"
echo "OK ready"
while IFS= read -r line; do
  case "$line" in
    ping) echo "OK pong" ;;
    crlf) printf 'OK crlf\r\n' ;;
    bad) echo "ERR 42 device says no" ;;
    hang) ;;
    slow) sleep 1; echo "OK late" ;;
    quit) exit 0 ;;
    exit) echo "OK bye"; exit 0 ;;
    *) echo "OK $line" ;;
  esac
done
"#;

pub fn script_args(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

pub async fn start(script: &str) -> ProcessTransport {
    ProcessTransport::start_with_timeout(SHELL, &script_args(script), Duration::from_secs(5))
        .await
        .expect("helper should start")
}
