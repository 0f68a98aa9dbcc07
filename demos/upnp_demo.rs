//! Exercises [`DeviceHost`] and [`ControlPoint`] against each other over the network:
//! `host` publishes a SwitchPower-style binary light, `control-point` discovers it,
//! watches its `Status` variable, and drives it through `SetTarget`/`GetStatus`.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use upnp_stack::{
    config::{ControlPointConfig, HostConfig},
    control_point::ControlPoint,
    datatype::{DataType, Value},
    description::{self, BuilderMode},
    host::{DeviceHost, RootDeviceSpec},
    model::{Action, ArgumentDirection, ArgumentSpec, Device, DeviceBuilder, Eventing, Origin, Service},
    soap::{ActionError, ActionErrorCode},
    types::{ResourceType, ServiceId, Udn},
};

#[derive(Parser)]
#[command(name = "upnp-demo")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a demo binary light and keep it on the network until interrupted.
    Host,
    /// Discover devices, subscribe to the first SwitchPower service found, then flip it.
    ControlPoint,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Args::parse().command {
        Command::Host => run_host().await,
        Command::ControlPoint => run_control_point().await,
    }
}

/// Builds a throwaway `SwitchPower1`/`BinaryLight1` tree purely to render the
/// description/SCPD documents `DeviceHost` will later re-parse off disk — the host
/// treats its files as the source of truth, the same way it treats a caller-supplied
/// description on startup.
fn build_switch_power_prototype(udn: &Udn) -> (Arc<Device>, ServiceId, Arc<Service>) {
    let service_id = ServiceId::new("upnp-org", "switchpower1");

    let target_var = Arc::new(crate::upnp_state_variable(
        "Target",
        DataType::Boolean,
        Eventing::None,
        Value::Boolean(false),
    ));
    let status_var = Arc::new(crate::upnp_state_variable(
        "Status",
        DataType::Boolean,
        Eventing::UnicastOnly,
        Value::Boolean(false),
    ));

    let set_target = Arc::new(Action::new(
        "SetTarget",
        vec![ArgumentSpec {
            name: "newTargetValue".into(),
            direction: ArgumentDirection::In,
            related_state_variable: target_var.clone(),
            is_retval: false,
        }],
    ));
    let get_target = Arc::new(Action::new(
        "GetTarget",
        vec![ArgumentSpec {
            name: "RetTargetValue".into(),
            direction: ArgumentDirection::Out,
            related_state_variable: target_var.clone(),
            is_retval: true,
        }],
    ));
    let get_status = Arc::new(Action::new(
        "GetStatus",
        vec![ArgumentSpec {
            name: "ResultStatus".into(),
            direction: ArgumentDirection::Out,
            related_state_variable: status_var.clone(),
            is_retval: true,
        }],
    ));

    let service = Service::new(
        ResourceType::service("schemas-upnp-org", "SwitchPower", 1),
        service_id.clone(),
        "scpd.xml",
        "control",
        "event",
        vec![set_target, get_target, get_status],
        vec![target_var, status_var],
    );

    let builder = DeviceBuilder {
        device_type: ResourceType::device("schemas-upnp-org", "BinaryLight", 1),
        udn: udn.clone(),
        friendly_name: "upnp-stack demo light".into(),
        manufacturer: "upnp-stack".into(),
        manufacturer_url: None,
        model_description: Some("demo SwitchPower device".into()),
        model_name: "upnp-stack-demo-light".into(),
        model_number: None,
        model_url: None,
        serial_number: None,
        upc: None,
        presentation_url: None,
        icons: Vec::new(),
        services: vec![service.clone()],
        embedded_devices: Vec::new(),
    };
    let device = Device::new_root(builder, Origin::Host);
    (device, service_id, service)
}

async fn run_host() -> anyhow::Result<()> {
    let base_dir: PathBuf = std::env::temp_dir().join(format!("upnp-stack-demo-{}", std::process::id()));
    tokio::fs::create_dir_all(&base_dir).await?;

    let udn = Udn::generate();
    let (prototype, service_id, prototype_service) = build_switch_power_prototype(&udn);
    let description_xml = description::render_device_description(&prototype, 1)?;
    tokio::fs::write(base_dir.join("device_description.xml"), description_xml).await?;
    let scpd_xml = description::render_scpd(&prototype_service)?;
    tokio::fs::write(base_dir.join("scpd.xml"), scpd_xml).await?;

    let host = DeviceHost::new(HostConfig::default());
    let device = host
        .add_root_device(RootDeviceSpec {
            description_path: base_dir.join("device_description.xml"),
            base_dir: base_dir.clone(),
            mode: BuilderMode::Lenient,
            handlers: HashMap::new(),
        })
        .await?;

    let service = device.find_service(&service_id).expect("switch power service present").clone();
    let target = service.find_state_variable("Target").expect("Target variable present").clone();
    let status = service.find_state_variable("Status").expect("Status variable present").clone();

    {
        let target = target.clone();
        let status = status.clone();
        service
            .find_action("SetTarget")
            .expect("SetTarget present")
            .set_handler(Arc::new(move |inputs| {
                let target = target.clone();
                let status = status.clone();
                Box::pin(async move {
                    let new_value = inputs.get("newTargetValue").cloned().ok_or_else(|| {
                        ActionError::with_description(ActionErrorCode::InvalidArgs, "missing newTargetValue")
                    })?;
                    target.set(new_value.clone()).await.map_err(ActionError::from)?;
                    status.set(new_value).await.map_err(ActionError::from)?;
                    Ok(HashMap::new())
                })
            }))
            .ok();
    }
    {
        let target = target.clone();
        service
            .find_action("GetTarget")
            .expect("GetTarget present")
            .set_handler(Arc::new(move |_inputs| {
                let target = target.clone();
                Box::pin(async move {
                    let mut out = HashMap::new();
                    out.insert("RetTargetValue".to_string(), target.get().await);
                    Ok(out)
                })
            }))
            .ok();
    }
    {
        let status = status.clone();
        service
            .find_action("GetStatus")
            .expect("GetStatus present")
            .set_handler(Arc::new(move |_inputs| {
                let status = status.clone();
                Box::pin(async move {
                    let mut out = HashMap::new();
                    out.insert("ResultStatus".to_string(), status.get().await);
                    Ok(out)
                })
            }))
            .ok();
    }

    host.init().await?;
    tracing::info!(udn = %udn.as_str(), "demo light published, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    host.quit().await?;
    Ok(())
}

async fn run_control_point() -> anyhow::Result<()> {
    let cp = ControlPoint::new(ControlPointConfig::default());
    cp.init().await?;

    tracing::info!("searching for devices for 5 seconds");
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    let devices = cp.devices().await;
    tracing::info!(count = devices.len(), "discovered devices");
    let service_id = ServiceId::new("upnp-org", "switchpower1");
    let Some((device, service)) = devices.iter().find_map(|d| d.walk().into_iter().find_map(|node| node.find_service(&service_id).map(|s| (d.clone(), s.clone())))) else {
        tracing::warn!("no SwitchPower service found on the network");
        cp.quit().await;
        return Ok(());
    };
    tracing::info!(friendly_name = %device.friendly_name, "found a switch power device");

    let set_target = service.find_action("SetTarget").expect("SetTarget present").clone();
    let mut inputs = HashMap::new();
    inputs.insert("newTargetValue".to_string(), Value::Boolean(true));
    cp.invoke_action(set_target, inputs).await?;
    tracing::info!("invoked SetTarget(true)");

    let get_status = service.find_action("GetStatus").expect("GetStatus present").clone();
    let outputs = cp.invoke_action(get_status, HashMap::new()).await?;
    tracing::info!(?outputs, "GetStatus result");

    cp.quit().await;
    Ok(())
}

/// Small convenience wrapper since `StateVariable::new` is otherwise a five-argument
/// positional call at every use site in this file.
fn upnp_state_variable(
    name: &str,
    data_type: DataType,
    eventing: Eventing,
    default: Value,
) -> upnp_stack::model::StateVariable {
    upnp_stack::model::StateVariable::new(name, data_type, eventing, None, Some(default))
}
