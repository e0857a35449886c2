//! Known USB serial adapters seen on embedded development benches.
//!
//! The catalog maps a USB VID:PID tuple to a human readable adapter name,
//! how many serial interfaces the adapter exposes, and which boards it
//! commonly shows up on. It never changes at runtime.

/// A USB serial adapter the monitor knows how to name.
#[derive(Debug, PartialEq, Eq)]
pub struct KnownDevice {
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Human readable adapter name.
    pub name: &'static str,
    /// How many serial interfaces the adapter exposes.
    pub expected_ports: usize,
    /// Boards this adapter commonly belongs to, most likely first.
    pub boards: &'static [&'static str],
}

/// Per-interface function names for multi-port adapters.
struct PortFunctions {
    device_name: &'static str,
    functions: &'static [&'static str],
}

/// The static adapter catalog.
pub static KNOWN_DEVICES: &[KnownDevice] = &[
    // FTDI
    KnownDevice {
        vid: 0x0403,
        pid: 0x6010,
        name: "FTDI FT2232H",
        expected_ports: 2,
        boards: &["VMK180", "ZCU102", "Various"],
    },
    KnownDevice {
        vid: 0x0403,
        pid: 0x6011,
        name: "FTDI FT4232H",
        expected_ports: 4,
        boards: &["VMK180", "ZCU102"],
    },
    KnownDevice {
        vid: 0x0403,
        pid: 0x6014,
        name: "FTDI FT232H",
        expected_ports: 1,
        boards: &["Generic"],
    },
    KnownDevice {
        vid: 0x0403,
        pid: 0x6001,
        name: "FTDI FT232R",
        expected_ports: 1,
        boards: &["Generic"],
    },
    // Xilinx/AMD
    KnownDevice {
        vid: 0x04b4,
        pid: 0x0008,
        name: "Cypress FX3",
        expected_ports: 4,
        boards: &["Versal VMK180", "ZCU102"],
    },
    // Microchip PolarFire SoC
    KnownDevice {
        vid: 0x10c4,
        pid: 0xea71,
        name: "Silicon Labs CP210x",
        expected_ports: 4,
        boards: &["PolarFire SoC"],
    },
    KnownDevice {
        vid: 0x10c4,
        pid: 0xea60,
        name: "Silicon Labs CP210x",
        expected_ports: 1,
        boards: &["PolarFire SoC", "Generic"],
    },
    // STMicroelectronics
    KnownDevice {
        vid: 0x0483,
        pid: 0x374b,
        name: "STM32 ST-LINK",
        expected_ports: 1,
        boards: &["STM32H563", "STM32 boards"],
    },
    KnownDevice {
        vid: 0x0483,
        pid: 0x374e,
        name: "STM32 Virtual COM Port",
        expected_ports: 1,
        boards: &["STM32H563"],
    },
    KnownDevice {
        vid: 0x0483,
        pid: 0x5740,
        name: "STM32 USB CDC",
        expected_ports: 1,
        boards: &["USB Relay Controller"],
    },
    // USB relay / generic bridges
    KnownDevice {
        vid: 0x1a86,
        pid: 0x7523,
        name: "CH340 USB-Serial",
        expected_ports: 1,
        boards: &["USB Relay", "Generic"],
    },
    KnownDevice {
        vid: 0x067b,
        pid: 0x2303,
        name: "Prolific PL2303",
        expected_ports: 1,
        boards: &["Generic"],
    },
    // Debuggers
    KnownDevice {
        vid: 0x0897,
        pid: 0x0002,
        name: "Lauterbach TRACE32",
        expected_ports: 1,
        boards: &["Debugger"],
    },
];

static PORT_FUNCTIONS: &[PortFunctions] = &[
    PortFunctions {
        device_name: "FTDI FT2232H",
        functions: &["UART/JTAG Port A", "UART/JTAG Port B"],
    },
    PortFunctions {
        device_name: "FTDI FT4232H",
        functions: &["UART0/JTAG", "UART1", "UART2", "UART3"],
    },
    PortFunctions {
        device_name: "Cypress FX3",
        functions: &["UART0 (Console)", "UART1 (PMC)", "UART2 (Debug)", "UART3"],
    },
    PortFunctions {
        device_name: "Silicon Labs CP210x",
        functions: &["UART0", "UART1", "UART2", "UART3"],
    },
];

/// Look up an adapter by VID:PID.
pub fn lookup_known_device(vid: u16, pid: u16) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES
        .iter()
        .find(|device| device.vid == vid && device.pid == pid)
}

/// Look up the function name of one interface of a multi-port adapter.
pub fn lookup_port_function(device_name: &str, interface: usize) -> Option<&'static str> {
    PORT_FUNCTIONS
        .iter()
        .find(|pf| pf.device_name == device_name)
        .and_then(|pf| pf.functions.get(interface))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cp210x_is_known() {
        let device = lookup_known_device(0x10c4, 0xea71).unwrap();

        assert_eq!(device.name, "Silicon Labs CP210x");
        assert_eq!(device.expected_ports, 4);
    }

    #[test]
    fn unknown_vid_pid() {
        assert!(lookup_known_device(0xffff, 0xffff).is_none());
    }

    #[test]
    fn cp210x_interface_2_is_uart2() {
        assert_eq!(
            lookup_port_function("Silicon Labs CP210x", 2),
            Some("UART2")
        );
    }

    #[test]
    fn function_lookup_past_last_interface() {
        assert_eq!(lookup_port_function("FTDI FT2232H", 2), None);
    }

    #[test]
    fn function_lookup_unknown_adapter() {
        assert_eq!(lookup_port_function("No Such Adapter", 0), None);
    }
}
