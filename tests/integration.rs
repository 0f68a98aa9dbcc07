//! End-to-end host/control-point pairing over real loopback sockets: discovery,
//! SOAP action invocation, and GENA change delivery (a binary-light SwitchPower
//! device, the same shape the demo binary publishes).

use std::{collections::HashMap, sync::Arc, time::Duration};

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

fn state_variable(
    name: &str,
    data_type: DataType,
    eventing: Eventing,
    default: Value,
) -> upnp_stack::model::StateVariable {
    upnp_stack::model::StateVariable::new(name, data_type, eventing, None, Some(default))
}

/// Builds a throwaway `SwitchPower1`/`BinaryLight1` tree purely to render the
/// description/SCPD the host will re-parse off disk, mirroring how the demo binary
/// seeds its own device directory.
fn build_switch_power_prototype(udn: &Udn) -> (Arc<Device>, ServiceId, Arc<Service>) {
    let service_id = ServiceId::new("upnp-org", "switchpower1");

    let target_var = Arc::new(state_variable("Target", DataType::Boolean, Eventing::None, Value::Boolean(false)));
    let status_var = Arc::new(state_variable(
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
        vec![set_target, get_status],
        vec![target_var, status_var],
    );

    let builder = DeviceBuilder {
        device_type: ResourceType::device("schemas-upnp-org", "BinaryLight", 1),
        udn: udn.clone(),
        friendly_name: "integration test light".into(),
        manufacturer: "upnp-stack".into(),
        manufacturer_url: None,
        model_description: Some("test SwitchPower device".into()),
        model_name: "upnp-stack-test-light".into(),
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

async fn write_prototype_to_disk(base_dir: &std::path::Path, udn: &Udn) -> anyhow::Result<(ServiceId, std::path::PathBuf)> {
    tokio::fs::create_dir_all(base_dir).await?;
    let (prototype, service_id, service) = build_switch_power_prototype(udn);
    let description_path = base_dir.join("device_description.xml");
    tokio::fs::write(&description_path, description::render_device_description(&prototype, 1)?).await?;
    tokio::fs::write(base_dir.join("scpd.xml"), description::render_scpd(&service)?).await?;
    Ok((service_id, description_path))
}

/// Polls `f` until it returns `Some`, or panics once `timeout` elapses.
async fn poll_until<T, F>(timeout: Duration, mut f: impl FnMut() -> F) -> T
where
    F: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = f().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for condition");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test]
async fn host_and_control_point_discover_invoke_and_deliver_events() {
    let base_dir = std::env::temp_dir().join(format!("upnp-stack-it-{}", std::process::id()));
    let udn = Udn::generate();
    let (service_id, description_path) = write_prototype_to_disk(&base_dir, &udn).await.expect("seed device files");

    let host = DeviceHost::new(HostConfig::default());
    let device = host
        .add_root_device(RootDeviceSpec {
            description_path,
            base_dir: base_dir.clone(),
            mode: BuilderMode::Lenient,
            handlers: HashMap::new(),
        })
        .await
        .expect("add root device");

    let service = device.find_service(&service_id).expect("switch power service present").clone();
    let target = service.find_state_variable("Target").expect("Target present").clone();
    let status = service.find_state_variable("Status").expect("Status present").clone();

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
                    let new_value = inputs
                        .get("newTargetValue")
                        .cloned()
                        .ok_or_else(|| ActionError::with_description(ActionErrorCode::InvalidArgs, "missing newTargetValue"))?;
                    target.set(new_value.clone()).await.map_err(ActionError::from)?;
                    status.set(new_value).await.map_err(ActionError::from)?;
                    Ok(HashMap::new())
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

    host.init().await.expect("host init");
    // Give the responder/announcer background tasks a moment to actually be listening
    // before the control point's initial M-SEARCH goes out.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cp = ControlPoint::new(ControlPointConfig::default());
    cp.init().await.expect("control point init");

    let found = poll_until(Duration::from_secs(10), || async {
        cp.devices()
            .await
            .into_iter()
            .find_map(|d| d.walk().into_iter().find_map(|node| node.find_service(&service_id).map(|s| (d.clone(), s.clone()))))
    })
    .await;
    let (discovered_device, discovered_service) = found;
    assert_eq!(discovered_device.udn, udn);

    let set_target = discovered_service.find_action("SetTarget").expect("SetTarget present").clone();
    let mut inputs = HashMap::new();
    inputs.insert("newTargetValue".to_string(), Value::Boolean(true));
    cp.invoke_action(set_target, inputs).await.expect("invoke SetTarget");

    let get_status = discovered_service.find_action("GetStatus").expect("GetStatus present").clone();
    let outputs = cp.invoke_action(get_status, HashMap::new()).await.expect("invoke GetStatus");
    assert_eq!(outputs.get("ResultStatus"), Some(&Value::Boolean(true)));

    // GENA: the control point auto-subscribes to every evented service on fetch, so the
    // SetTarget handler's write above should eventually land in the shadow copy too.
    let shadow_status = discovered_service.find_state_variable("Status").expect("Status present").clone();
    poll_until(Duration::from_secs(10), || {
        let shadow_status = shadow_status.clone();
        async move { (shadow_status.get().await == Value::Boolean(true)).then_some(()) }
    })
    .await;

    cp.quit().await;
    host.quit().await.expect("host quit");
}
