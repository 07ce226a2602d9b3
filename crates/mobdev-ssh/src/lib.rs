use std::path::PathBuf;
use std::sync::Arc;
use async_trait::async_trait;
use tracing::{error, info, warn};

use mobdev_config::ConfigServiceImpl;
use mobdev_traits::config::{Config, ConfigService, DEFAULT_SSH_KEY_PATH};
use mobdev_traits::devices::{DeviceOs, DeviceService, LOCAL_DEVICE_ID};
use mobdev_traits::process::{CommandOutput, CommandRunner, CommandSpec};
use mobdev_traits::ssh::{Prompt, SshError, SshService};

mod tunnel;

pub use tunnel::{TunnelLease, TunnelPool};

/// Reads a public key from stdin and appends it to `authorized_keys` unless present.
const INSTALL_KEY_SCRIPT: &str = "umask 077; mkdir -p ~/.ssh && key=$(cat) && \
touch ~/.ssh/authorized_keys && \
(grep -qxF \"$key\" ~/.ssh/authorized_keys || echo \"$key\" >> ~/.ssh/authorized_keys) && \
chmod 700 ~/.ssh && chmod 600 ~/.ssh/authorized_keys";

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// The private key location, with `~` expanded.
pub fn key_path(config: &Config) -> PathBuf {
    let raw = config.ssh_key_path.as_deref().unwrap_or(DEFAULT_SSH_KEY_PATH);
    ConfigServiceImpl::expand_tilde(raw).unwrap_or_else(|| PathBuf::from(raw))
}

pub fn public_key_path(config: &Config) -> PathBuf {
    let mut path = key_path(config).into_os_string();
    path.push(".pub");
    PathBuf::from(path)
}

/// Arguments for `ssh` through a local forward. Host keys are not pinned since
/// every forward lands on `localhost` with a different port.
fn ssh_args(config: &Config, local_port: u16) -> Vec<String> {
    vec![
        "-q".to_string(),
        format!("-p{}", local_port),
        format!("{}@localhost", config.ssh_user()),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("UserKnownHostsFile={}", NULL_DEVICE),
    ]
}

fn local_shell() -> CommandSpec {
    if cfg!(windows) {
        CommandSpec::new(std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string()))
    } else {
        CommandSpec::new(std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()))
    }
}

fn report_exit(what: &str, output: &CommandOutput) {
    if !output.success() {
        warn!("{} exited with status {:?}", what, output.status);
    }
}

pub struct SshServiceImpl {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    devices: Arc<dyn DeviceService>,
    prompt: Arc<dyn Prompt>,
    tunnels: TunnelPool,
}

impl SshServiceImpl {
    pub fn new(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        devices: Arc<dyn DeviceService>,
        prompt: Arc<dyn Prompt>,
    ) -> Self {
        Self {
            config: config.clone(),
            tunnels: TunnelPool::new(config, runner.clone()),
            runner,
            devices,
            prompt,
        }
    }

    async fn deploy_key(&self, udid: &str, public_key: &str) -> Result<CommandOutput, SshError> {
        let lease = self.tunnels.acquire(udid).await.map_err(SshError::Tunnel)?;

        let spec = CommandSpec::new(self.config.ssh())
            .args(ssh_args(&self.config, lease.local_port))
            .arg(INSTALL_KEY_SCRIPT)
            .stdin(format!("{}\n", public_key.trim()));
        let result = self.runner.output(&spec).await;

        lease.release().await;
        Ok(result?)
    }
}

#[async_trait]
impl SshService for SshServiceImpl {
    async fn keygen(&self) -> Result<bool, SshError> {
        let path = key_path(&self.config);

        if path.exists() {
            info!("Private key ({}) already exists", path.display());
            return Ok(true);
        }

        if !self.prompt.confirm("SSH key pair not found. Generate now?") {
            info!("Key generation cancelled");
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SshError::KeyDir(parent.to_string_lossy().into_owned(), e))?;
        }

        let spec = CommandSpec::new(self.config.ssh_keygen())
            .arg("-f")
            .arg(path.to_string_lossy());
        match self.runner.interactive(&spec).await {
            Ok(output) if output.success() => {
                info!("Generated SSH key pair at {}", path.display());
                Ok(true)
            }
            Ok(output) => {
                error!("ssh-keygen exited with status {:?}", output.status);
                Err(SshError::KeygenFailed)
            }
            Err(e) => {
                error!("Could not run ssh-keygen: {}", e);
                Err(SshError::KeygenFailed)
            }
        }
    }

    async fn copy_id(&self, device_id: &str) -> Result<(), SshError> {
        if device_id == LOCAL_DEVICE_ID {
            return Err(SshError::LocalDevice);
        }

        if !self.keygen().await? {
            return Err(SshError::KeygenDeclined);
        }

        let device = self.devices.find(device_id).await?;
        if device.os != DeviceOs::Ios {
            return Err(SshError::UnsupportedOs(device.os.to_string()));
        }

        let pub_path = public_key_path(&self.config);
        let public_key = tokio::fs::read_to_string(&pub_path)
            .await
            .map_err(|e| SshError::PublicKeyRead(pub_path.to_string_lossy().into_owned(), e))?;

        match self.deploy_key(&device.id, &public_key).await {
            Ok(output) if output.success() => {
                info!("Successfully installed SSH public key on \"{}\"", device.name);
                Ok(())
            }
            Ok(output) => {
                let reason = match output.stderr.trim() {
                    "" => format!("ssh exited with status {:?}", output.status),
                    stderr => stderr.to_string(),
                };
                Err(SshError::DeployFailed(device.name, reason))
            }
            Err(SshError::Process(e)) => Err(SshError::DeployFailed(device.name, e.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn shell(&self, device_id: &str) -> Result<(), SshError> {
        let device = self.devices.find(device_id).await?;
        info!("Opening shell on \"{}\"", device.name);

        match device.os {
            DeviceOs::Local => {
                let output = self.runner.interactive(&local_shell()).await?;
                report_exit("Local shell", &output);
            }
            DeviceOs::Ios => {
                let lease = self.tunnels.acquire(&device.id).await.map_err(SshError::Tunnel)?;
                let spec = CommandSpec::new(self.config.ssh()).args(ssh_args(&self.config, lease.local_port));
                let result = self.runner.interactive(&spec).await;
                lease.release().await;
                report_exit(&format!("SSH: {}", device.name), &result?);
            }
            DeviceOs::Android => {
                let spec = CommandSpec::new(self.config.adb()).args(["-s", device.id.as_str(), "shell"]);
                let output = self.runner.interactive(&spec).await?;
                report_exit(&format!("adb shell: {}", device.name), &output);
            }
            DeviceOs::Unknown(os) => return Err(SshError::UnsupportedOs(os)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobdev_devices::DeviceServiceImpl;
    use mobdev_process::testing::{fail, ok, CallKind, FakeRunner};
    use std::net::TcpListener;

    const UDID: &str = "00008030-001A2B3C4D5E802E";
    const PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOw7 dev@laptop";

    struct Answer(bool);

    impl Prompt for Answer {
        fn confirm(&self, _message: &str) -> bool {
            self.0
        }
    }

    fn listen_on_forward(spec: &CommandSpec) -> Option<TcpListener> {
        let port: u16 = spec.args.first()?.split(':').next()?.parse().ok()?;
        TcpListener::bind(("127.0.0.1", port)).ok()
    }

    /// A runner that knows one iPhone and one Android emulator.
    fn device_runner() -> FakeRunner {
        FakeRunner::new()
            .on("idevice_id -l", ok(&format!("{UDID}\n")))
            .on("ideviceinfo", ok("Test iPhone\n"))
            .on("adb devices -l", ok("List of devices attached\nemulator-5554 device model:sdk_gphone64\n"))
            .on("iproxy", ok(""))
            .with_spawn_hook(listen_on_forward)
    }

    struct Fixture {
        service: SshServiceImpl,
        runner: Arc<FakeRunner>,
        _dir: tempfile::TempDir,
        key: PathBuf,
    }

    fn fixture(runner: FakeRunner, answer: bool, with_key: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("keys").join("id_ed25519");
        if with_key {
            std::fs::create_dir_all(key.parent().unwrap()).unwrap();
            std::fs::write(&key, "PRIVATE").unwrap();
            std::fs::write(key.with_extension("pub"), format!("{PUBLIC_KEY}\n")).unwrap();
        }

        let config = Config {
            ssh_key_path: Some(key.to_string_lossy().into_owned()),
            port_wait_interval_ms: Some(20),
            port_wait_timeout_ms: Some(2000),
            port_probe_timeout_ms: Some(200),
            ..Config::default()
        };
        let runner = Arc::new(runner);
        let devices = Arc::new(DeviceServiceImpl::new(&config, runner.clone()));
        let service = SshServiceImpl::new(&config, runner.clone(), devices, Arc::new(Answer(answer)));
        Fixture { service, runner, _dir: dir, key }
    }

    #[test]
    fn test_public_key_path_appends_suffix() {
        let config = Config { ssh_key_path: Some("/keys/id_rsa".to_string()), ..Config::default() };
        assert_eq!(public_key_path(&config), PathBuf::from("/keys/id_rsa.pub"));
    }

    #[test]
    fn test_ssh_args_use_forwarded_port() {
        let args = ssh_args(&Config::default(), 49152);
        assert_eq!(&args[..3], &["-q", "-p49152", "root@localhost"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[tokio::test]
    async fn test_keygen_with_existing_key() {
        let fx = fixture(FakeRunner::new(), false, true);
        assert!(fx.service.keygen().await.unwrap());
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_keygen_declined() {
        let fx = fixture(FakeRunner::new(), false, false);
        assert!(!fx.service.keygen().await.unwrap());
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_keygen_runs_ssh_keygen() {
        let fx = fixture(FakeRunner::new().on("ssh-keygen", ok("")), true, false);
        assert!(fx.service.keygen().await.unwrap());

        let calls = fx.runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallKind::Interactive);
        assert_eq!(calls[0].spec.args, vec!["-f".to_string(), fx.key.to_string_lossy().into_owned()]);
        assert!(fx.key.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_keygen_failure() {
        let fx = fixture(FakeRunner::new().on("ssh-keygen", fail(1, "")), true, false);
        assert!(matches!(fx.service.keygen().await, Err(SshError::KeygenFailed)));
    }

    #[tokio::test]
    async fn test_keygen_reports_unusable_key_directory() {
        let fx = fixture(FakeRunner::new().on("ssh-keygen", ok("")), true, false);
        std::fs::write(fx.key.parent().unwrap(), "not a directory").unwrap();

        let err = fx.service.keygen().await.unwrap_err();
        assert!(matches!(err, SshError::KeyDir(ref dir, _) if dir.ends_with("keys")));
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_copy_id_rejects_local() {
        let fx = fixture(device_runner(), true, true);
        assert!(matches!(fx.service.copy_id("local").await, Err(SshError::LocalDevice)));
    }

    #[tokio::test]
    async fn test_copy_id_rejects_android() {
        let fx = fixture(device_runner(), true, true);
        let err = fx.service.copy_id("emulator-5554").await.unwrap_err();
        assert_eq!(err.to_string(), "Device type \"android\" is not supported");
    }

    #[tokio::test]
    async fn test_copy_id_declined_keygen() {
        let fx = fixture(device_runner(), false, false);
        assert!(matches!(fx.service.copy_id(UDID).await, Err(SshError::KeygenDeclined)));
    }

    #[tokio::test]
    async fn test_copy_id_installs_key_through_tunnel() {
        let fx = fixture(device_runner().on("ssh", ok("")), true, true);
        fx.service.copy_id(UDID).await.unwrap();

        let calls = fx.runner.calls();
        let spawn = calls.iter().find(|c| c.kind == CallKind::Spawn).unwrap();
        let port = spawn.spec.args[0].split(':').next().unwrap().to_string();
        assert_eq!(spawn.spec.args[1..].to_vec(), vec!["-u".to_string(), UDID.to_string()]);

        let ssh = calls.iter().find(|c| c.spec.program == "ssh").unwrap();
        assert_eq!(ssh.kind, CallKind::Output);
        assert!(ssh.spec.args.contains(&format!("-p{port}")));
        assert_eq!(ssh.spec.stdin.as_deref(), Some(format!("{PUBLIC_KEY}\n").as_str()));
        assert!(ssh.spec.args.last().unwrap().contains("authorized_keys"));

        assert_eq!(fx.runner.kills(), vec!["iproxy"]);
    }

    #[tokio::test]
    async fn test_copy_id_failure_still_releases_tunnel() {
        let fx = fixture(device_runner().on("ssh", fail(255, "Connection closed by 127.0.0.1")), true, true);
        let err = fx.service.copy_id(UDID).await.unwrap_err();
        match err {
            SshError::DeployFailed(name, reason) => {
                assert_eq!(name, "Test iPhone");
                assert_eq!(reason, "Connection closed by 127.0.0.1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.runner.kills(), vec!["iproxy"]);
    }

    #[tokio::test]
    async fn test_shell_android_uses_adb() {
        let fx = fixture(device_runner().on("adb -s", ok("")), true, true);
        fx.service.shell("emulator-5554").await.unwrap();

        let last = fx.runner.calls().pop().unwrap();
        assert_eq!(last.kind, CallKind::Interactive);
        assert_eq!(last.line(), "adb -s emulator-5554 shell");
    }

    #[tokio::test]
    async fn test_shell_ios_releases_tunnel() {
        let fx = fixture(device_runner().on("ssh", ok("")), true, true);
        fx.service.shell(UDID).await.unwrap();

        let last = fx.runner.calls().pop().unwrap();
        assert_eq!(last.kind, CallKind::Interactive);
        assert!(last.line().starts_with("ssh -q -p"));
        assert_eq!(fx.runner.kills(), vec!["iproxy"]);
    }

    #[tokio::test]
    async fn test_shell_unknown_device() {
        let fx = fixture(device_runner(), true, true);
        assert!(matches!(fx.service.shell("ghost").await, Err(SshError::Device(_))));
    }
}
