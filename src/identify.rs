use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use nix::unistd::{access, AccessFlags};
use tracing::debug;

use crate::devices::{lookup_known_device, lookup_port_function, KnownDevice};
use crate::error::Error;

/// How many directory levels to ascend from the tty node while looking
/// for the USB interface and device directories.
const MAX_SYSFS_DEPTH: usize = 12;

/// Labels longer than this are truncated.
const MAX_LABEL: usize = 48;

/// A serial port identified through sysfs.
///
/// Produced once by [`identify_port`] and treated as immutable by the rest
/// of the system (only [`apply_board_overrides`] amends it, before any
/// monitoring starts).
#[derive(Debug, Clone)]
pub struct TtyPort {
    /// Device node, e.g. `/dev/ttyUSB0`.
    pub dev_path: PathBuf,
    /// The bare tty name, e.g. `ttyUSB0`.
    pub tty_name: String,
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// The USB interface index this tty belongs to.
    pub interface: usize,
    /// The USB serial number string, empty if the device has none.
    pub serial: String,
    /// USB manufacturer string, `Unknown` if absent.
    pub manufacturer: String,
    /// USB product string, `Unknown` if absent.
    pub product: String,
    /// USB topology path, e.g. `1-6.2`.
    pub usb_path: String,
    /// The catalog entry for this adapter, if any.
    pub known: Option<&'static KnownDevice>,
    /// What this interface does, e.g. `UART1`.
    pub function: &'static str,
    /// Board name from `~/.boards`, if the user pinned one.
    pub board_override: Option<String>,
    /// Filesystem-safe name used as the log filename stem.
    pub label: String,
}

impl TtyPort {
    /// The best board name we have: the user override, then the first
    /// catalog candidate, then `Unknown`.
    pub fn board(&self) -> &str {
        if let Some(board) = &self.board_override {
            return board;
        }

        self.known
            .and_then(|known| known.boards.first().copied())
            .unwrap_or("Unknown")
    }

    /// Key shared by all interfaces of one physical USB device.
    pub fn group_key(&self) -> String {
        format!(
            "{:04x}:{:04x}:{}:{}",
            self.vid, self.pid, self.serial, self.usb_path
        )
    }

    /// Regenerate [`TtyPort::label`] from the current identity.
    pub fn refresh_label(&mut self) {
        self.label = synthesize_label(self);
    }
}

impl Display for TtyPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.dev_path.display(), self.label)
    }
}

/// All interfaces of one physical USB device, sorted by interface index.
#[derive(Debug)]
pub struct DeviceGroup<'a> {
    /// The shared `vid:pid:serial:usb_path` key.
    pub key: String,
    /// Member ports.
    pub ports: Vec<&'a TtyPort>,
}

/// One `serial number -> board name` binding from `~/.boards`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardOverride {
    /// The USB serial number the binding applies to.
    pub serial: String,
    /// The board name to use.
    pub board: String,
}

/// Read one sysfs attribute file, trimming trailing whitespace.
fn read_sysfs_attr(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    Some(raw.trim_end().to_string())
}

fn read_sysfs_hex(path: &Path) -> Option<u16> {
    let raw = read_sysfs_attr(path)?;
    u16::from_str_radix(raw.trim(), 16).ok()
}

/// Extract the USB topology path (e.g. `1-6.2`) from a resolved sysfs path.
///
/// Finds `/usb<bus>/` and captures the following component up to the next
/// `/` or `:`.
fn extract_usb_path(sysfs_path: &str) -> Option<String> {
    let mut rest = sysfs_path;

    while let Some(at) = rest.find("/usb") {
        rest = &rest[at + 4..];

        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        if digits > 0 && rest[digits..].starts_with('/') {
            let component = &rest[digits + 1..];
            let end = component
                .find(|c| c == '/' || c == ':')
                .unwrap_or(component.len());

            if end > 0 {
                return Some(component[..end].to_string());
            }
            return None;
        }
    }

    None
}

/// Identify a single tty by walking sysfs from its device node up to the
/// USB interface and device directories.
///
/// Fails with [`Error::NotIdentified`] for ttys with no sysfs device link,
/// which is what virtual ttys look like.
pub fn identify_port(dev_path: &Path) -> Result<TtyPort, Error> {
    let tty_name = dev_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| dev_path.to_string_lossy().to_string());

    let sys_link = PathBuf::from(format!("/sys/class/tty/{tty_name}/device"));
    let resolved = fs::canonicalize(&sys_link).map_err(|_| Error::NotIdentified {
        dev_path: dev_path.display().to_string(),
    })?;

    let mut port = TtyPort {
        dev_path: dev_path.to_path_buf(),
        tty_name,
        vid: 0,
        pid: 0,
        interface: 0,
        serial: String::new(),
        manufacturer: String::new(),
        product: String::new(),
        usb_path: String::new(),
        known: None,
        function: "Main UART",
        board_override: None,
        label: String::new(),
    };

    // Walk upwards. For ttyUSB the interface directory (bInterfaceNumber)
    // and the USB device directory (idVendor) are distinct ancestors; for
    // ttyACM the resolved path already is the interface directory.
    let mut dir = resolved;
    let mut found_interface = false;

    for _ in 0..MAX_SYSFS_DEPTH {
        if !found_interface {
            if let Some(raw) = read_sysfs_attr(&dir.join("bInterfaceNumber")) {
                port.interface = raw.trim().parse().unwrap_or(0);
                found_interface = true;
            }
        }

        if let Some(vid) = read_sysfs_hex(&dir.join("idVendor")) {
            port.vid = vid;
            port.pid = read_sysfs_hex(&dir.join("idProduct")).unwrap_or(0);
            port.serial = read_sysfs_attr(&dir.join("serial")).unwrap_or_default();
            port.manufacturer = read_sysfs_attr(&dir.join("manufacturer")).unwrap_or_default();
            port.product = read_sysfs_attr(&dir.join("product")).unwrap_or_default();
            port.usb_path = extract_usb_path(&dir.to_string_lossy()).unwrap_or_default();
            break;
        }

        if !dir.pop() || dir.parent().is_none() {
            break;
        }
    }

    if port.manufacturer.is_empty() {
        port.manufacturer = "Unknown".to_string();
    }
    if port.product.is_empty() {
        port.product = "Unknown".to_string();
    }

    port.known = lookup_known_device(port.vid, port.pid);
    if let Some(known) = port.known {
        if let Some(function) = lookup_port_function(known.name, port.interface) {
            port.function = function;
        }
    }

    port.refresh_label();

    debug!(%port, vid = %format!("{:04x}", port.vid), pid = %format!("{:04x}", port.pid), "Identified");

    Ok(port)
}

/// Scan `/dev` for `ttyUSB*`, `ttyACM*` and `ttyUART*` nodes and identify
/// each of them. Unidentifiable nodes are skipped.
pub fn scan_all_ports() -> Vec<TtyPort> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            crate::hotplug::is_monitored_tty(&name).then(|| entry.path())
        })
        .sorted()
        .filter_map(|path| identify_port(&path).ok())
        .collect()
}

/// Uppercase a board name and replace spaces with underscores, bounded to
/// the label length limit.
fn upper_underscore(board: &str) -> String {
    board
        .chars()
        .map(|c| match c {
            ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .take(MAX_LABEL)
        .collect()
}

/// Derive the filesystem-safe label for a port.
///
/// Priority: user board override, then the catalog board name, then the
/// bare tty name. Single-port adapters get a plain `_UART` suffix,
/// multi-port adapters get `_UART<iface>`.
pub fn synthesize_label(port: &TtyPort) -> String {
    if let Some(board) = port
        .board_override
        .as_deref()
        .filter(|board| !board.is_empty())
    {
        return format!("{}_UART{}", upper_underscore(board), port.interface);
    }

    if let Some(known) = port.known {
        if let Some(board) = known.boards.first() {
            let clean = upper_underscore(board);
            return if known.expected_ports > 1 {
                format!("{}_UART{}", clean, port.interface)
            } else {
                format!("{clean}_UART")
            };
        }
    }

    port.tty_name.clone()
}

/// Group ports by physical USB device, preserving first-seen group order.
/// Members are sorted by interface index. Only the identification report
/// uses groups.
pub fn group_ports(ports: &[TtyPort]) -> Vec<DeviceGroup<'_>> {
    let mut groups: Vec<DeviceGroup> = Vec::new();

    for port in ports {
        let key = port.group_key();
        match groups.iter_mut().find(|group| group.key == key) {
            Some(group) => group.ports.push(port),
            None => groups.push(DeviceGroup {
                key,
                ports: vec![port],
            }),
        }
    }

    for group in &mut groups {
        group.ports.sort_by_key(|port| port.interface);
    }

    groups
}

/// Parse the contents of a `~/.boards` file.
///
/// A heading line `# === <board> ===` selects the current board; any later
/// line containing both `# USB:` and `S/N:` binds the serial number token
/// after `S/N:` to it. Lines with an empty board or serial are dropped.
pub fn parse_board_overrides(content: &str) -> Vec<BoardOverride> {
    let mut current_board = String::new();
    let mut overrides = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim_start();

        if let Some(heading) = trimmed.strip_prefix("# === ") {
            if let Some(end) = heading.find(" ===") {
                current_board = heading[..end].to_string();
            }
            continue;
        }

        if current_board.is_empty() || !line.contains("# USB:") || !line.contains("S/N:") {
            continue;
        }

        let Some(after) = line.split("S/N:").nth(1) else {
            continue;
        };
        let serial: String = after
            .trim_start_matches(' ')
            .chars()
            .take_while(|c| !c.is_whitespace())
            .collect();

        if !serial.is_empty() {
            overrides.push(BoardOverride {
                serial,
                board: current_board.clone(),
            });
        }
    }

    overrides
}

/// Load board overrides from `$HOME/.boards`. Missing file means none.
pub fn load_board_overrides() -> Vec<BoardOverride> {
    let Ok(home) = std::env::var("HOME") else {
        return Vec::new();
    };

    match fs::read_to_string(Path::new(&home).join(".boards")) {
        Ok(content) => parse_board_overrides(&content),
        Err(_) => Vec::new(),
    }
}

/// Apply overrides to scanned ports, regenerating labels for matches.
pub fn apply_board_overrides(ports: &mut [TtyPort], overrides: &[BoardOverride]) {
    for port in ports {
        if port.serial.is_empty() {
            continue;
        }

        if let Some(binding) = overrides.iter().find(|o| o.serial == port.serial) {
            port.board_override = Some(binding.board.clone());
            port.refresh_label();
        }
    }
}

fn access_string(dev_path: &Path) -> String {
    let mut out = String::new();
    if access(dev_path, AccessFlags::R_OK).is_ok() {
        out.push('R');
    }
    if access(dev_path, AccessFlags::W_OK).is_ok() {
        out.push('W');
    }
    if out.is_empty() {
        out.push_str("---");
    }
    out
}

/// Print the grouped port inventory report.
pub fn print_report(groups: &[DeviceGroup], verbose: bool) {
    let rule = "=".repeat(100);

    println!("\n{rule}");
    println!("USB Serial Port Inventory - Grouped by Device");
    println!("{rule}");

    if groups.is_empty() {
        println!("No USB serial ports found!");
        return;
    }

    for (index, group) in groups.iter().enumerate() {
        let first = group.ports[0];

        println!("\n{rule}");
        println!(
            "Device #{}: {} - {}",
            index + 1,
            first.manufacturer,
            first.product
        );
        println!("{rule}");

        println!("  VID:PID       : {:04x}:{:04x}", first.vid, first.pid);
        println!(
            "  Device Type   : {}",
            first.known.map_or("Unknown", |known| known.name)
        );

        let boards = if let Some(board) = &first.board_override {
            board.clone()
        } else if let Some(known) = first.known {
            known.boards.iter().join(", ")
        } else {
            "Unknown".to_string()
        };
        println!("  Possible Board: {boards}");

        if !first.serial.is_empty() {
            println!("  Serial Number : {}", first.serial);
        }
        println!("  USB Path      : {}", first.usb_path);
        println!(
            "  Port Count    : {}/{}",
            group.ports.len(),
            first
                .known
                .map_or(group.ports.len(), |known| known.expected_ports)
        );

        println!(
            "\n  {:<15} {:<7} {:<25} {:<8}",
            "Port", "Iface", "Function", "Access"
        );
        println!(
            "  {:<15} {:<7} {:<25} {:<8}",
            "---------------", "-------", "-------------------------", "--------"
        );

        for port in &group.ports {
            println!(
                "  {:<15} {:<7} {:<25} {:<8}",
                port.dev_path.display(),
                port.interface,
                port.function,
                access_string(&port.dev_path)
            );
        }

        if verbose {
            println!("\n  Labels:");
            for port in &group.ports {
                println!("    {} -> {}", port.dev_path.display(), port.label);
            }
        }
    }
}

/// The `identify` subcommand: scan, apply overrides, print the report.
pub fn run_identify(verbose: bool, save: bool) {
    let mut ports = scan_all_ports();

    let overrides = load_board_overrides();
    if !overrides.is_empty() {
        apply_board_overrides(&mut ports, &overrides);
    }

    let groups = group_ports(&ports);
    print_report(&groups, verbose);
    println!();

    if save {
        // TODO: write the discovered serial -> board bindings back to ~/.boards.
        println!("(--save is not implemented yet)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_port(tty_name: &str) -> TtyPort {
        TtyPort {
            dev_path: PathBuf::from(format!("/dev/{tty_name}")),
            tty_name: tty_name.to_string(),
            vid: 0,
            pid: 0,
            interface: 0,
            serial: String::new(),
            manufacturer: "Unknown".to_string(),
            product: "Unknown".to_string(),
            usb_path: String::new(),
            known: None,
            function: "Main UART",
            board_override: None,
            label: String::new(),
        }
    }

    #[test]
    fn label_with_board_override() {
        let mut port = bare_port("ttyUSB4");
        port.vid = 0x10c4;
        port.pid = 0xea71;
        port.known = lookup_known_device(0x10c4, 0xea71);
        port.interface = 0;
        port.board_override = Some("ZynqMP ZCU102".to_string());

        assert_eq!(synthesize_label(&port), "ZYNQMP_ZCU102_UART0");
    }

    #[test]
    fn label_from_catalog_multi_port() {
        let mut port = bare_port("ttyUSB0");
        port.known = lookup_known_device(0x10c4, 0xea71);
        port.interface = 1;

        assert_eq!(synthesize_label(&port), "POLARFIRE_SOC_UART1");
    }

    #[test]
    fn label_from_catalog_single_port() {
        let mut port = bare_port("ttyUSB0");
        port.known = lookup_known_device(0x0403, 0x6001);

        assert_eq!(synthesize_label(&port), "GENERIC_UART");
    }

    #[test]
    fn label_falls_back_to_tty_name() {
        let port = bare_port("ttyUSB99");

        assert_eq!(synthesize_label(&port), "ttyUSB99");
    }

    #[test]
    fn grouping_by_physical_device() {
        let mut a = bare_port("ttyUSB0");
        a.vid = 0x10c4;
        a.pid = 0xea71;
        a.serial = "ABC123".to_string();
        a.usb_path = "1-6".to_string();
        a.interface = 1;

        let mut b = a.clone();
        b.tty_name = "ttyUSB1".to_string();
        b.interface = 0;

        let mut c = bare_port("ttyUSB2");
        c.vid = 0x0403;
        c.pid = 0x6001;
        c.serial = "XYZ789".to_string();
        c.usb_path = "1-4".to_string();

        let ports = vec![a, b, c];
        let groups = group_ports(&ports);

        assert_eq!(groups.len(), 2);

        let mut sizes: Vec<_> = groups.iter().map(|g| g.ports.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);

        // Members sorted by interface index.
        let pair = groups.iter().find(|g| g.ports.len() == 2).unwrap();
        assert_eq!(pair.ports[0].interface, 0);
        assert_eq!(pair.ports[1].interface, 1);
    }

    #[test]
    fn usb_path_extraction() {
        assert_eq!(
            extract_usb_path("/sys/devices/pci0000:00/0000:00:14.0/usb1/1-6/1-6.2/1-6.2:1.0"),
            Some("1-6".to_string())
        );
        assert_eq!(extract_usb_path("/sys/devices/platform/serial8250"), None);
    }

    #[test]
    fn override_file_parsing() {
        let content = "\
# Board identifications
# === ZynqMP ZCU102 ===
# USB: 1-6.2 | S/N: ABC123
# === PolarFire SoC ===
# USB: 1-4 | S/N: XYZ789 extra
# USB: 1-5 | S/N:
not a comment line
";

        let overrides = parse_board_overrides(content);

        assert_eq!(
            overrides,
            vec![
                BoardOverride {
                    serial: "ABC123".to_string(),
                    board: "ZynqMP ZCU102".to_string()
                },
                BoardOverride {
                    serial: "XYZ789".to_string(),
                    board: "PolarFire SoC".to_string()
                },
            ]
        );
    }

    #[test]
    fn override_application_regenerates_label() {
        let mut port = bare_port("ttyUSB0");
        port.known = lookup_known_device(0x10c4, 0xea71);
        port.serial = "ABC123".to_string();
        port.refresh_label();
        assert_eq!(port.label, "POLARFIRE_SOC_UART0");

        let overrides = vec![BoardOverride {
            serial: "ABC123".to_string(),
            board: "ZynqMP ZCU102".to_string(),
        }];

        let mut ports = vec![port];
        apply_board_overrides(&mut ports, &overrides);

        assert_eq!(ports[0].label, "ZYNQMP_ZCU102_UART0");
        assert_eq!(ports[0].board(), "ZynqMP ZCU102");
    }
}
