//! Operations a plugin can ask the host to perform
//!
//! Every method maps to exactly one permission. The mapping is an exhaustive
//! match, so adding a method without deciding its permission does not compile.

use crate::errors::EngineError;
use crate::permissions::Permission;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMethod {
    ReadStorage,
    WriteStorage,
    HttpRequest,
    OpenWebsocket,
    SubscribeEvent,
    PublishEvent,
    ReadDeviceData,
    WriteDeviceData,
    ReadSensorData,
    WriteSensorData,
    ReadAlerts,
    WriteAlert,
    ReadDiagnosis,
    WriteDiagnosis,
    RunInference,
    Embed,
    ShowNotification,
    RenderWidget,
    ReadConfig,
    WriteLog,
}

impl PluginMethod {
    pub const ALL: [PluginMethod; 20] = [
        PluginMethod::ReadStorage,
        PluginMethod::WriteStorage,
        PluginMethod::HttpRequest,
        PluginMethod::OpenWebsocket,
        PluginMethod::SubscribeEvent,
        PluginMethod::PublishEvent,
        PluginMethod::ReadDeviceData,
        PluginMethod::WriteDeviceData,
        PluginMethod::ReadSensorData,
        PluginMethod::WriteSensorData,
        PluginMethod::ReadAlerts,
        PluginMethod::WriteAlert,
        PluginMethod::ReadDiagnosis,
        PluginMethod::WriteDiagnosis,
        PluginMethod::RunInference,
        PluginMethod::Embed,
        PluginMethod::ShowNotification,
        PluginMethod::RenderWidget,
        PluginMethod::ReadConfig,
        PluginMethod::WriteLog,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadStorage => "read_storage",
            Self::WriteStorage => "write_storage",
            Self::HttpRequest => "http_request",
            Self::OpenWebsocket => "open_websocket",
            Self::SubscribeEvent => "subscribe_event",
            Self::PublishEvent => "publish_event",
            Self::ReadDeviceData => "read_device_data",
            Self::WriteDeviceData => "write_device_data",
            Self::ReadSensorData => "read_sensor_data",
            Self::WriteSensorData => "write_sensor_data",
            Self::ReadAlerts => "read_alerts",
            Self::WriteAlert => "write_alert",
            Self::ReadDiagnosis => "read_diagnosis",
            Self::WriteDiagnosis => "write_diagnosis",
            Self::RunInference => "run_inference",
            Self::Embed => "embed",
            Self::ShowNotification => "show_notification",
            Self::RenderWidget => "render_widget",
            Self::ReadConfig => "read_config",
            Self::WriteLog => "write_log",
        }
    }

    pub const fn required_permission(self) -> Permission {
        match self {
            Self::ReadStorage => Permission::StorageRead,
            Self::WriteStorage => Permission::StorageWrite,
            Self::HttpRequest => Permission::NetworkHttp,
            Self::OpenWebsocket => Permission::NetworkWs,
            Self::SubscribeEvent => Permission::EventSubscribe,
            Self::PublishEvent => Permission::EventPublish,
            Self::ReadDeviceData => Permission::DataDeviceRead,
            Self::WriteDeviceData => Permission::DataDeviceWrite,
            Self::ReadSensorData => Permission::DataSensorRead,
            Self::WriteSensorData => Permission::DataSensorWrite,
            Self::ReadAlerts => Permission::DataAlertRead,
            Self::WriteAlert => Permission::DataAlertWrite,
            Self::ReadDiagnosis => Permission::DataDiagnosisRead,
            Self::WriteDiagnosis => Permission::DataDiagnosisWrite,
            Self::RunInference => Permission::ModelInference,
            Self::Embed => Permission::ModelEmbed,
            Self::ShowNotification => Permission::UiNotification,
            Self::RenderWidget => Permission::UiWidget,
            Self::ReadConfig => Permission::SystemConfigRead,
            Self::WriteLog => Permission::SystemLog,
        }
    }
}

impl fmt::Display for PluginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| EngineError::UnknownOperation(s.to_string()))
    }
}
