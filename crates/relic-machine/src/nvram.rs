//! Per-machine NVRAM persistence: the battery-backed CMOS register file
//! round-trips through a flat file next to the guest configuration.

use std::io;
use std::path::Path;

use relic_devices::cmos::{Cmos, CMOS_SIZE};

pub fn save(cmos: &Cmos, path: &Path) -> io::Result<()> {
    std::fs::write(path, cmos.nvram_bytes())
}

pub fn load(cmos: &mut Cmos, path: &Path) -> io::Result<bool> {
    match std::fs::read(path) {
        Ok(bytes) => {
            if bytes.len() != CMOS_SIZE {
                log::warn!(
                    "NVRAM file {} has {} bytes (expected {}); ignoring",
                    path.display(),
                    bytes.len(),
                    CMOS_SIZE
                );
                return Ok(false);
            }
            cmos.load_nvram(&bytes);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
