//! OpenSSH client transport.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::debug;

use crate::exec::display_args;
use crate::transport::Transport;

/// Connection target for the `ssh` client
#[derive(Debug, Clone, Default)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Remote command and extra arguments, passed through unchanged
    pub command: Vec<String>,
}

/// Launches the system `ssh` client with the signed certificate
#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    target: SshTarget,
    certificate: PathBuf,
    identity: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(target: SshTarget, certificate: impl Into<PathBuf>) -> Self {
        Self {
            program: "ssh".to_string(),
            target,
            certificate: certificate.into(),
            identity: None,
        }
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Private key to pair with the certificate
    pub fn identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn command_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(identity) = &self.identity {
            args.push(OsString::from("-i"));
            args.push(identity.as_os_str().to_os_string());
        }

        let mut cert_option = OsString::from("CertificateFile=");
        cert_option.push(self.certificate.as_os_str());
        args.push(OsString::from("-o"));
        args.push(cert_option);

        if let Some(port) = self.target.port {
            args.push(OsString::from("-p"));
            args.push(OsString::from(port.to_string()));
        }
        if let Some(user) = &self.target.user {
            args.push(OsString::from("-l"));
            args.push(OsString::from(user));
        }
        args.push(OsString::from(&self.target.host));
        args.extend(self.target.command.iter().map(OsString::from));
        args
    }
}

impl Transport for SshTransport {
    type Connection = ExitStatus;
    type Error = io::Error;

    fn connect(&mut self) -> Result<ExitStatus, io::Error> {
        let args = self.command_args();
        debug!(program = %self.program, args = ?display_args(&args), "Launching ssh");
        Command::new(&self.program).args(&args).status()
    }
}

/// Private key matching a `.pub` public key path, if it exists
pub fn private_key_for(public_key: &Path) -> Option<PathBuf> {
    if public_key.extension()? != "pub" {
        return None;
    }
    let private = public_key.with_extension("");
    private.is_file().then_some(private)
}
