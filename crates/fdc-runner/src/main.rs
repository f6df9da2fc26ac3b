//! Headless WD1793 exercise harness.
//!
//! Mounts each image through the controller's host channel, then
//! drives a scripted bus session against it: restore, read address,
//! and a sector sweep across the first tracks. Reports per-image
//! results and can emit a JSON session report with SHA-1 image
//! fingerprints.
//!
//! ```text
//! fdc-runner [-v] [--json report.json] <image.dmk|image.hfe> [...]
//! ```

mod fs_storage;

use std::path::Path;

use serde::Serialize;
use sha1::{Digest, Sha1};

use fs_storage::FsStorage;
use wd_1793::{status_bits, Wd1793, HOST_SELECT};

const TICK_US: u32 = 50;

#[derive(Serialize)]
struct ImageReport {
    name: String,
    sha1: String,
    mounted: bool,
    tracks: u8,
    write_protected: bool,
    sectors_read: u32,
    crc_errors: u32,
    not_found: u32,
    first_id: Option<[u8; 4]>,
}

#[derive(Serialize)]
struct SessionReport {
    firmware: String,
    images: Vec<ImageReport>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    let json_path = args
        .iter()
        .position(|a| a == "--json")
        .and_then(|i| args.get(i + 1))
        .cloned();
    let paths: Vec<&str> = args[1..]
        .iter()
        .filter(|a| !a.starts_with('-'))
        .filter(|a| json_path.as_deref() != Some(a.as_str()))
        .map(String::as_str)
        .collect();

    if paths.is_empty() {
        eprintln!("Usage: fdc-runner [-v] [--json report.json] <image.dmk|image.hfe> [...]");
        eprintln!("       -v, --verbose  Per-sector detail");
        std::process::exit(1);
    }

    let mut report = SessionReport {
        firmware: wd_1793::host::VERSION_TEXT.to_string(),
        images: Vec::new(),
    };
    let mut failures = 0;

    for path in paths {
        match exercise_image(path, verbose) {
            Ok(image) => {
                let ok = image.mounted && image.crc_errors == 0 && image.sectors_read > 0;
                if ok {
                    println!(
                        "[PASS] {} - {} tracks, {} sectors read",
                        image.name, image.tracks, image.sectors_read
                    );
                } else {
                    failures += 1;
                    println!(
                        "[FAIL] {} - mounted={} read={} crc_errors={} not_found={}",
                        image.name,
                        image.mounted,
                        image.sectors_read,
                        image.crc_errors,
                        image.not_found
                    );
                }
                report.images.push(image);
            }
            Err(e) => {
                failures += 1;
                println!("[ERROR] {path} - {e}");
            }
        }
    }

    if let Some(json_path) = json_path {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&json_path, text) {
                    eprintln!("cannot write {json_path}: {e}");
                }
            }
            Err(e) => eprintln!("cannot serialise report: {e}"),
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
}

fn exercise_image(path: &str, verbose: bool) -> Result<ImageReport, String> {
    let path = Path::new(path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| "not a file path".to_string())?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let data = std::fs::read(path).map_err(|e| format!("cannot read: {e}"))?;
    let sha1 = hex(&Sha1::digest(&data));

    let mut storage = FsStorage::new(dir.unwrap_or_else(|| Path::new(".")));
    let mut fdc = Wd1793::new();
    fdc.init(&mut storage);
    fdc.write_nmi_mask(0x80);

    // Mount through the host channel onto drive 0.
    fdc.write_drive_select(HOST_SELECT);
    fdc.write_command(4);
    host_send(&mut fdc, &mut storage, format!("0 {name}").as_bytes());

    let mounted = fdc.drive(0).mounted();
    let tracks = fdc.drive(0).tracks();
    let write_protected = fdc.drive(0).write_protected();

    let mut image = ImageReport {
        name,
        sha1,
        mounted,
        tracks,
        write_protected,
        sectors_read: 0,
        crc_errors: 0,
        not_found: 0,
        first_id: None,
    };

    if !mounted {
        return Ok(image);
    }

    fdc.write_drive_select(0x01);
    fdc.write_command(0x00); // restore
    pump(&mut fdc, &mut storage, 1_000);

    // First ID field on track 0.
    fdc.write_command(0xC0);
    let id = collect_read(&mut fdc, &mut storage, 6);
    if id.len() == 6 {
        image.first_id = Some([id[0], id[1], id[2], id[3]]);
    }

    // Sector sweep over the first few tracks.
    for track in 0..tracks.min(4) {
        fdc.write_data(track);
        fdc.write_command(0x10); // seek, 3 ms steps
        pump(&mut fdc, &mut storage, 60_000);

        for sector in 0..=31u8 {
            fdc.write_sector_reg(sector);
            fdc.write_command(0x80);
            let data = collect_read(&mut fdc, &mut storage, 1024);
            let status = fdc.read_status();

            if status & status_bits::NOT_FOUND != 0 {
                image.not_found += 1;
                continue;
            }
            if status & status_bits::CRC_ERROR != 0 {
                image.crc_errors += 1;
            }
            if !data.is_empty() {
                image.sectors_read += 1;
                if verbose {
                    println!(
                        "  track {track:2} sector {sector:2}: {} bytes, status ${status:02X}",
                        data.len()
                    );
                }
            }
        }
    }

    Ok(image)
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn pump(fdc: &mut Wd1793, storage: &mut FsStorage, us: u32) {
    for _ in 0..us.div_ceil(TICK_US) {
        fdc.tick(TICK_US, storage);
    }
}

/// Poll status and collect DRQ bytes until the command completes.
fn collect_read(fdc: &mut Wd1793, storage: &mut FsStorage, limit: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..limit * 8 + 4_000 {
        fdc.tick(TICK_US, storage);
        let status = fdc.read_status();
        if status & status_bits::DRQ != 0 {
            out.push(fdc.read_data());
        } else if status & status_bits::BUSY == 0 {
            if !out.is_empty() || status & status_bits::NOT_FOUND != 0 {
                break;
            }
        }
    }
    out
}

/// Send a length-prefixed host-channel payload through the DRQ
/// handshake.
fn host_send(fdc: &mut Wd1793, storage: &mut FsStorage, payload: &[u8]) {
    let mut queue: Vec<u8> = vec![payload.len() as u8];
    queue.extend_from_slice(payload);
    let mut it = queue.iter();
    let mut pending = it.next();
    for _ in 0..queue.len() * 16 + 2_000 {
        fdc.tick(TICK_US, storage);
        if fdc.read_status() & status_bits::DRQ != 0 {
            if let Some(&b) = pending {
                fdc.write_data(b);
                pending = it.next();
            }
        }
        if pending.is_none() {
            break;
        }
    }
    pump(fdc, storage, 1_000);
}
