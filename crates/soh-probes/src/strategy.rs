use crate::ProbeError;
use regex::Regex;
use soh_core::OsFamily;

/// Command templates and response checks for one guest OS family.
///
/// Response matching is literal: each predicate looks for the exact substrings
/// the guest tools print.
pub trait ProbeStrategy: Send + Sync {
    fn family(&self) -> OsFamily;

    fn address_command(&self) -> &'static str;
    /// Whether the interface address (and mask, where the tool prints it) shows up.
    fn address_configured(&self, response: &str, address: &str, mask: u8) -> bool;

    fn route_command(&self) -> &'static str;
    fn default_route_configured(&self, response: &str, gateway: &str) -> bool;

    fn ping_command(&self, target: &str) -> String;
    /// Whether a single ping got no reply.
    fn ping_failed(&self, response: &str) -> bool;

    fn process_command(&self, process: &str) -> String;
    fn process_running(&self, response: &str) -> bool;

    fn listener_command(&self, port: &str) -> String;
    fn listening(&self, response: &str) -> bool;

    fn load_command(&self) -> &'static str;
    /// Extract the load figure from the load command's output.
    ///
    /// # Errors
    /// Returns `ProbeError` if the output does not have the expected shape.
    fn parse_load(&self, response: &str) -> Result<String, ProbeError>;

    /// Interpreter used to run uploaded custom test scripts.
    fn default_executor(&self) -> &'static str;
}

pub struct LinuxProbes;

pub struct WindowsProbes;

static LINUX: LinuxProbes = LinuxProbes;
static WINDOWS: WindowsProbes = WindowsProbes;

#[must_use]
pub fn strategy(family: OsFamily) -> &'static dyn ProbeStrategy {
    match family {
        OsFamily::Linux => &LINUX,
        OsFamily::Windows => &WINDOWS,
    }
}

impl ProbeStrategy for LinuxProbes {
    fn family(&self) -> OsFamily {
        OsFamily::Linux
    }

    fn address_command(&self) -> &'static str {
        "ip addr"
    }

    fn address_configured(&self, response: &str, address: &str, mask: u8) -> bool {
        response.contains(&format!("{address}/{mask}"))
    }

    fn route_command(&self) -> &'static str {
        "ip route"
    }

    fn default_route_configured(&self, response: &str, gateway: &str) -> bool {
        response.contains(&format!("default via {gateway}"))
    }

    fn ping_command(&self, target: &str) -> String {
        format!("ping -c 1 {target}")
    }

    fn ping_failed(&self, response: &str) -> bool {
        response.contains("0 received")
    }

    fn process_command(&self, process: &str) -> String {
        format!("pgrep -f {process}")
    }

    fn process_running(&self, response: &str) -> bool {
        !response.trim().is_empty()
    }

    fn listener_command(&self, port: &str) -> String {
        format!("ss -lntu state all 'sport = {port}'")
    }

    // `ss` always prints a header line.
    fn listening(&self, response: &str) -> bool {
        non_empty_lines(response) > 1
    }

    fn load_command(&self) -> &'static str {
        "cat /proc/loadavg"
    }

    fn parse_load(&self, response: &str) -> Result<String, ProbeError> {
        let parts: Vec<&str> = response.split_whitespace().collect();

        if parts.len() != 5 {
            return Err(ProbeError::InvalidResponse {
                command: self.load_command().to_string(),
                response: response.to_string(),
            });
        }

        Ok(parts[0].to_string())
    }

    fn default_executor(&self) -> &'static str {
        "bash"
    }
}

impl ProbeStrategy for WindowsProbes {
    fn family(&self) -> OsFamily {
        OsFamily::Windows
    }

    fn address_command(&self) -> &'static str {
        "ipconfig /all"
    }

    fn address_configured(&self, response: &str, address: &str, _mask: u8) -> bool {
        response.contains(address)
    }

    fn route_command(&self) -> &'static str {
        "route print"
    }

    fn default_route_configured(&self, response: &str, gateway: &str) -> bool {
        let pattern = format!(r"0\.0\.0\.0\s+0\.0\.0\.0\s+{}", regex::escape(gateway));
        Regex::new(&pattern).is_ok_and(|re| re.is_match(response))
    }

    fn ping_command(&self, target: &str) -> String {
        format!("ping -n 1 {target}")
    }

    fn ping_failed(&self, response: &str) -> bool {
        response.contains("Destination host unreachable")
    }

    fn process_command(&self, process: &str) -> String {
        format!(r#"powershell -command "Get-Process {process} -ErrorAction SilentlyContinue""#)
    }

    fn process_running(&self, response: &str) -> bool {
        !response.trim().is_empty()
    }

    fn listener_command(&self, port: &str) -> String {
        format!(
            r#"powershell -command "netstat -an | select-string -pattern 'listening' | select-string -pattern '{port}'""#
        )
    }

    fn listening(&self, response: &str) -> bool {
        non_empty_lines(response) > 0
    }

    fn load_command(&self) -> &'static str {
        r#"powershell -command "Get-WmiObject Win32_Processor | Measure-Object -Property LoadPercentage -Average | Select -ExpandProperty Average""#
    }

    fn parse_load(&self, response: &str) -> Result<String, ProbeError> {
        let load = response.trim();

        if load.is_empty() {
            return Err(ProbeError::EmptyResponse(self.load_command().to_string()));
        }

        Ok(load.to_string())
    }

    fn default_executor(&self) -> &'static str {
        "powershell -NoProfile -ExecutionPolicy bypass -File"
    }
}

fn non_empty_lines(response: &str) -> usize {
    response
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ADDR: &str = "\
2: ens3: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 10.0.0.1/24 brd 10.0.0.255 scope global ens3
";

    const ROUTE_PRINT: &str = "\
IPv4 Route Table
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0     10.0.0.254       10.0.0.2     25
";

    #[test]
    fn test_strategy_lookup() {
        assert_eq!(strategy(OsFamily::Linux).family(), OsFamily::Linux);
        assert_eq!(strategy(OsFamily::Windows).family(), OsFamily::Windows);
    }

    #[test]
    fn test_linux_address_needs_mask() {
        let linux = strategy(OsFamily::Linux);
        assert!(linux.address_configured(IP_ADDR, "10.0.0.1", 24));
        assert!(!linux.address_configured(IP_ADDR, "10.0.0.1", 16));
        assert!(!linux.address_configured(IP_ADDR, "10.0.0.2", 24));
    }

    #[test]
    fn test_windows_address_ignores_mask() {
        let windows = strategy(OsFamily::Windows);
        assert!(windows.address_configured("IPv4 Address. . : 10.0.0.2(Preferred)", "10.0.0.2", 8));
    }

    #[test]
    fn test_linux_default_route() {
        let linux = strategy(OsFamily::Linux);
        let routes = "default via 10.0.0.254 dev ens3\n10.0.0.0/24 dev ens3";
        assert!(linux.default_route_configured(routes, "10.0.0.254"));
        assert!(!linux.default_route_configured(routes, "10.0.0.1"));
    }

    #[test]
    fn test_windows_default_route() {
        let windows = strategy(OsFamily::Windows);
        assert!(windows.default_route_configured(ROUTE_PRINT, "10.0.0.254"));
        assert!(!windows.default_route_configured(ROUTE_PRINT, "10.0.0.253"));
        // Dots in the gateway are literal.
        assert!(!windows.default_route_configured(ROUTE_PRINT, "10a0.0.254"));
    }

    #[test]
    fn test_ping_failure_markers() {
        let linux = strategy(OsFamily::Linux);
        assert!(linux.ping_failed("1 packets transmitted, 0 received, 100% packet loss"));
        assert!(!linux.ping_failed("1 packets transmitted, 1 received, 0% packet loss"));
        assert_eq!(linux.ping_command("10.0.0.2"), "ping -c 1 10.0.0.2");

        let windows = strategy(OsFamily::Windows);
        assert!(windows.ping_failed("Reply from 10.0.0.2: Destination host unreachable."));
        assert_eq!(windows.ping_command("10.0.0.2"), "ping -n 1 10.0.0.2");
    }

    #[test]
    fn test_listener_line_thresholds() {
        let linux = strategy(OsFamily::Linux);
        let header = "Netid State Recv-Q Send-Q Local Address:Port Peer Address:Port\n";
        assert!(!linux.listening(header));
        assert!(linux.listening(&format!("{header}tcp LISTEN 0 128 0.0.0.0:22 0.0.0.0:*\n")));

        let windows = strategy(OsFamily::Windows);
        assert!(!windows.listening("\n  \n"));
        assert!(windows.listening("  TCP    0.0.0.0:3389    0.0.0.0:0    LISTENING\n"));
    }

    #[test]
    fn test_process_commands() {
        assert_eq!(strategy(OsFamily::Linux).process_command("sshd"), "pgrep -f sshd");
        assert_eq!(
            strategy(OsFamily::Windows).process_command("svchost"),
            r#"powershell -command "Get-Process svchost -ErrorAction SilentlyContinue""#
        );
        assert!(!strategy(OsFamily::Linux).process_running("\n"));
        assert!(strategy(OsFamily::Linux).process_running("1234\n"));
    }

    #[test]
    fn test_parse_load() {
        let linux = strategy(OsFamily::Linux);
        assert_eq!(linux.parse_load("0.42 0.30 0.25 1/123 4567\n").unwrap(), "0.42");
        assert!(matches!(
            linux.parse_load("garbage"),
            Err(ProbeError::InvalidResponse { .. })
        ));

        let windows = strategy(OsFamily::Windows);
        assert_eq!(windows.parse_load(" 17\r\n").unwrap(), "17");
        assert!(matches!(
            windows.parse_load("  "),
            Err(ProbeError::EmptyResponse(_))
        ));
    }

    #[test]
    fn test_default_executors() {
        assert_eq!(strategy(OsFamily::Linux).default_executor(), "bash");
        assert_eq!(
            strategy(OsFamily::Windows).default_executor(),
            "powershell -NoProfile -ExecutionPolicy bypass -File"
        );
    }
}
