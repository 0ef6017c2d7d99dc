//! Deployment configuration shared by the server and client binaries,
//! loaded from a JSON file.

use crate::{LinefsError, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

/// The environment-supplied settings. Every field is required in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// IPv4 dotted-quad the server binds (and clients dial)
    pub server_ip: String,
    /// TCP port, 1024..=65535
    pub server_port: u16,
    /// worker thread count, 1..=100
    pub server_threads: usize,
    /// client thread count for test mode, 1..=1000
    pub client_threads: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            server_ip: "127.0.0.1".to_string(),
            server_port: 9000,
            server_threads: 4,
            client_threads: 8,
        }
    }
}

impl Config {
    /// reads and validates a configuration file
    ///
    /// # Errors
    /// fails with [`LinefsError::Io`] if the file cannot be opened, with
    /// [`LinefsError::Serialization`] if it is not the expected JSON shape,
    /// and with [`LinefsError::Config`] if any value is out of range
    pub fn load(path: &Path) -> Result<Config> {
        let file = File::open(path)?;
        let config: Config = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// checks every field against its allowed range
    pub fn validate(&self) -> Result<()> {
        if self.server_ip.parse::<Ipv4Addr>().is_err() {
            return Err(LinefsError::Config(format!(
                "server_ip is not an IPv4 address: {}",
                self.server_ip
            )));
        }
        if self.server_port < 1024 {
            return Err(LinefsError::Config(format!(
                "server_port must be between 1024 and 65535, got {}",
                self.server_port
            )));
        }
        if self.server_threads < 1 || self.server_threads > 100 {
            return Err(LinefsError::Config(format!(
                "server_threads must be between 1 and 100, got {}",
                self.server_threads
            )));
        }
        if self.client_threads < 1 || self.client_threads > 1000 {
            return Err(LinefsError::Config(format!(
                "client_threads must be between 1 and 1000, got {}",
                self.client_threads
            )));
        }
        Ok(())
    }

    /// the socket address the server listens on
    pub fn server_addr(&self) -> Result<SocketAddr> {
        let ip: Ipv4Addr = self
            .server_ip
            .parse()
            .map_err(|_| LinefsError::Config(format!("invalid server_ip: {}", self.server_ip)))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.server_port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        Config::default()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(valid().validate().is_ok());
        assert_eq!(
            valid().server_addr().unwrap().to_string(),
            "127.0.0.1:9000"
        );
    }

    #[test]
    fn load_parses_a_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server_ip": "10.0.0.7",
                "server_port": 9100,
                "server_threads": 8,
                "client_threads": 16
            }}"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server_ip, "10.0.0.7");
        assert_eq!(config.server_port, 9100);
        assert_eq!(config.server_threads, 8);
        assert_eq!(config.client_threads, 16);
    }

    #[test]
    fn load_rejects_a_missing_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "server_ip": "127.0.0.1", "server_port": 9000 }}"#).unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(LinefsError::Serialization(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut bad_ip = valid();
        bad_ip.server_ip = "localhost".to_string();
        assert!(bad_ip.validate().is_err());

        let mut low_port = valid();
        low_port.server_port = 80;
        assert!(low_port.validate().is_err());

        let mut no_workers = valid();
        no_workers.server_threads = 0;
        assert!(no_workers.validate().is_err());

        let mut too_many_workers = valid();
        too_many_workers.server_threads = 101;
        assert!(too_many_workers.validate().is_err());

        let mut too_many_clients = valid();
        too_many_clients.client_threads = 1001;
        assert!(too_many_clients.validate().is_err());
    }
}
