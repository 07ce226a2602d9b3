use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, warn};

use mobdev_traits::config::Config;
use mobdev_traits::devices::{
    Device, DeviceError, DeviceKind, DeviceOs, DeviceService, TreeItem, LOCAL_DEVICE_ID,
};
use mobdev_traits::process::{CommandRunner, CommandSpec, ProcessError};

/// True when an adb serial points at the subsystem's debug port on this machine.
fn is_subsystem_serial(serial: &str, config: &Config) -> bool {
    if serial == config.wsa_address() {
        return true;
    }
    let Some((host, port)) = serial.rsplit_once(':') else {
        return false;
    };
    let loopback = matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]");
    let configured_loopback = matches!(config.wsa_host(), "localhost" | "127.0.0.1" | "::1");
    loopback && configured_loopback && port.parse::<u16>().ok() == Some(config.wsa_port())
}

/// Parses `adb devices -l`. Only devices in the `device` state are kept.
pub fn parse_adb_devices(text: &str, config: &Config) -> Vec<Device> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            if state != "device" {
                debug!("Skipping adb device {} in state '{}'", serial, state);
                return None;
            }

            let model = fields.find_map(|f| f.strip_prefix("model:"));
            let name = model
                .map(|m| m.replace('_', " "))
                .unwrap_or_else(|| serial.to_string());

            let kind = if is_subsystem_serial(serial, config) {
                DeviceKind::Subsystem
            } else if serial.contains(':') {
                DeviceKind::Remote
            } else {
                DeviceKind::Usb
            };

            Some(Device {
                id: serial.to_string(),
                name,
                kind,
                os: DeviceOs::Android,
            })
        })
        .collect()
}

/// Parses `idevice_id -l`, one UDID per line.
pub fn parse_idevice_ids(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        // Newer libimobiledevice prints "<udid> (USB)" or "(Network)".
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// One tree node per device, with its attributes as children.
pub fn device_tree(devices: &[Device]) -> Vec<TreeItem> {
    devices
        .iter()
        .map(|device| {
            TreeItem::new(&device.name, format!("{} · {}", device.os, device.kind)).with_children(vec![
                TreeItem::new("id", &device.id),
                TreeItem::new("os", device.os.to_string()),
                TreeItem::new("type", device.kind.to_string()),
            ])
        })
        .collect()
}

#[derive(Clone)]
pub struct DeviceServiceImpl {
    config: Config,
    runner: Arc<dyn CommandRunner>,
}

impl DeviceServiceImpl {
    async fn ios_devices(&self) -> Result<Vec<Device>, ProcessError> {
        let spec = CommandSpec::new(self.config.idevice_id()).arg("-l");
        let output = self.runner.checked_output(&spec).await?;

        let mut devices = Vec::new();
        for udid in parse_idevice_ids(&output.stdout) {
            let name = self.ios_device_name(&udid).await.unwrap_or_else(|| udid.clone());
            devices.push(Device {
                id: udid,
                name,
                kind: DeviceKind::Usb,
                os: DeviceOs::Ios,
            });
        }
        Ok(devices)
    }

    async fn ios_device_name(&self, udid: &str) -> Option<String> {
        let spec = CommandSpec::new(self.config.ideviceinfo()).args(["-u", udid, "-k", "DeviceName"]);
        match self.runner.checked_output(&spec).await {
            Ok(output) => Some(output.stdout.trim().to_string()).filter(|n| !n.is_empty()),
            Err(e) => {
                debug!("Could not read name of {}: {}", udid, e);
                None
            }
        }
    }

    async fn android_devices(&self) -> Result<Vec<Device>, ProcessError> {
        let spec = CommandSpec::new(self.config.adb()).args(["devices", "-l"]);
        let output = self.runner.checked_output(&spec).await?;
        Ok(parse_adb_devices(&output.stdout, &self.config))
    }
}

#[async_trait]
impl DeviceService for DeviceServiceImpl {
    fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config: config.clone(),
            runner,
        }
    }

    async fn list_devices(&self) -> Vec<Device> {
        let mut devices = vec![Device::local()];

        match self.ios_devices().await {
            Ok(found) => devices.extend(found),
            Err(e) => warn!("iOS devices unavailable: {}", e),
        }
        match self.android_devices().await {
            Ok(found) => devices.extend(found),
            Err(e) => warn!("Android devices unavailable: {}", e),
        }

        debug!("Found {} targets", devices.len());
        devices
    }

    async fn find(&self, id: &str) -> Result<Device, DeviceError> {
        if id == LOCAL_DEVICE_ID {
            return Ok(Device::local());
        }
        self.list_devices()
            .await
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobdev_process::testing::{fail, ok, FakeRunner};

    const ADB_OUTPUT: &str = "\
* daemon not running; starting now at tcp:5037
* daemon started successfully
List of devices attached
emulator-5554          device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64xa transport_id:1
127.0.0.1:58526        device product:windows_x86_64 model:Subsystem_for_Android_TM_ device:windows_x86_64 transport_id:3
192.168.1.40:5555      device product:oriole model:Pixel_6 device:oriole transport_id:4
R58M123ABC             unauthorized usb:1-1 transport_id:5

";

    fn service(runner: FakeRunner) -> (DeviceServiceImpl, Arc<FakeRunner>) {
        let runner = Arc::new(runner);
        let service = DeviceServiceImpl::new(&Config::default(), runner.clone());
        (service, runner)
    }

    #[test]
    fn test_parse_adb_devices() {
        let devices = parse_adb_devices(ADB_OUTPUT, &Config::default());
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].id, "emulator-5554");
        assert_eq!(devices[0].name, "sdk gphone64 x86 64");
        assert_eq!(devices[0].kind, DeviceKind::Usb);

        assert_eq!(devices[1].kind, DeviceKind::Subsystem);
        assert_eq!(devices[1].name, "Subsystem for Android TM ");

        assert_eq!(devices[2].kind, DeviceKind::Remote);
        assert!(devices.iter().all(|d| d.os == DeviceOs::Android));
    }

    #[test]
    fn test_parse_adb_devices_without_model() {
        let devices = parse_adb_devices("List of devices attached\nHT7A1B\tdevice\n", &Config::default());
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "HT7A1B");
    }

    #[test]
    fn test_subsystem_serial_requires_configured_port() {
        let config = Config { wsa_port: Some(5555), ..Config::default() };
        assert!(is_subsystem_serial("localhost:5555", &config));
        assert!(is_subsystem_serial("127.0.0.1:5555", &config));
        assert!(!is_subsystem_serial("127.0.0.1:58526", &config));
        assert!(!is_subsystem_serial("emulator-5555", &config));
    }

    #[test]
    fn test_parse_idevice_ids() {
        let ids = parse_idevice_ids("00008030-001A2B3C4D5E802E (USB)\n\nabcdef0123456789abcdef0123456789abcdef01\n");
        assert_eq!(ids, vec!["00008030-001A2B3C4D5E802E", "abcdef0123456789abcdef0123456789abcdef01"]);
    }

    #[test]
    fn test_device_tree() {
        let items = device_tree(&[Device::local()]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "Local System");
        assert_eq!(items[0].description, "local · local");
        assert_eq!(items[0].children[0].tooltip, "id: local");
    }

    #[tokio::test]
    async fn test_list_devices_merges_platforms() {
        let (service, runner) = service(
            FakeRunner::new()
                .on("idevice_id -l", ok("00008030-001A2B3C4D5E802E\n"))
                .on("ideviceinfo -u 00008030-001A2B3C4D5E802E", ok("Jane's iPhone\n"))
                .on("adb devices -l", ok(ADB_OUTPUT)),
        );

        let devices = service.list_devices().await;
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["local", "00008030-001A2B3C4D5E802E", "emulator-5554", "127.0.0.1:58526", "192.168.1.40:5555"]);
        assert_eq!(devices[1].name, "Jane's iPhone");
        assert_eq!(devices[1].os, DeviceOs::Ios);
        assert_eq!(runner.lines().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_tools_do_not_fail_listing() {
        let (service, _) = service(FakeRunner::new().on("adb devices -l", fail(1, "cannot connect to daemon")));
        let devices = service.list_devices().await;
        assert_eq!(devices, vec![Device::local()]);
    }

    #[tokio::test]
    async fn test_ios_name_falls_back_to_udid() {
        let (service, _) = service(
            FakeRunner::new()
                .on("idevice_id -l", ok("00008030-001A2B3C4D5E802E\n"))
                .on("ideviceinfo", fail(255, "ERROR: Could not connect to lockdownd")),
        );
        let device = service.find("00008030-001A2B3C4D5E802E").await.unwrap();
        assert_eq!(device.name, "00008030-001A2B3C4D5E802E");
    }

    #[tokio::test]
    async fn test_find_local_runs_nothing() {
        let (service, runner) = service(FakeRunner::new());
        assert_eq!(service.os("local").await.unwrap(), DeviceOs::Local);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_find_unknown_device() {
        let (service, _) = service(FakeRunner::new().on("adb devices -l", ok("List of devices attached\n")));
        let err = service.find("ghost").await.unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(id) if id == "ghost"));
    }
}
