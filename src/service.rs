//! Windows service integration.
//!
//! Registers with the service control manager, reports status
//! transitions, and runs the agent inside the service process. Session
//! change notifications from the SCM are logged; the session monitor's
//! own polling is the source of truth for desktop state.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};
use windows_service::service::{
    ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
    ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

pub const SERVICE_NAME: &str = "RcAgent";
pub const SERVICE_DISPLAY_NAME: &str = "Remote Control Agent";

windows_service::define_windows_service!(ffi_service_main, service_main);

fn service_main(arguments: Vec<OsString>) {
    if let Err(e) = run_service(arguments) {
        error!("service error: {:?}", e);
    }
}

/// Hand the process over to the service dispatcher.
pub fn dispatch() -> Result<()> {
    windows_service::service_dispatcher::start(SERVICE_NAME, ffi_service_main)
        .context("service dispatcher failed")?;
    Ok(())
}

enum ServiceCommand {
    Stop,
}

fn run_service(_arguments: Vec<OsString>) -> Result<()> {
    info!("starting {} service", SERVICE_NAME);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ServiceCommand>(4);

    let handler_tx = cmd_tx.clone();
    let event_handler = move |control_event| -> ServiceControlHandlerResult {
        match control_event {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                let _ = handler_tx.blocking_send(ServiceCommand::Stop);
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            ServiceControl::SessionChange(param) => {
                info!(session_id = param.session_id, reason = ?param.reason, "session change");
                ServiceControlHandlerResult::NoError
            }
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    };

    let status_handle = service_control_handler::register(SERVICE_NAME, event_handler)
        .context("failed to register service control handler")?;

    report_status(
        &status_handle,
        ServiceState::StartPending,
        Duration::from_secs(30),
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    let result = runtime.block_on(async {
        let agent = crate::build_agent()?;
        agent.start();

        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", agent.settings.listen_port))
                .await
                .with_context(|| {
                    format!("failed to bind listen port {}", agent.settings.listen_port)
                })?;

        let server = tokio::spawn(rc_agent::http::serve(
            Arc::clone(&agent),
            listener,
            agent.shutdown_token(),
        ));

        report_status(&status_handle, ServiceState::Running, Duration::ZERO)?;
        info!("service is now running");

        let _ = cmd_rx.recv().await;
        info!("stop requested");

        report_status(
            &status_handle,
            ServiceState::StopPending,
            Duration::from_secs(10),
        )?;

        agent.stop();
        let _ = server.await;
        Ok::<(), anyhow::Error>(())
    });

    report_status(&status_handle, ServiceState::Stopped, Duration::ZERO)?;
    info!("service stopped");
    result
}

fn report_status(
    status_handle: &service_control_handler::ServiceStatusHandle,
    state: ServiceState,
    wait_hint: Duration,
) -> Result<()> {
    let controls_accepted = match state {
        ServiceState::StartPending | ServiceState::StopPending | ServiceState::Stopped => {
            ServiceControlAccept::empty()
        }
        _ => {
            ServiceControlAccept::STOP
                | ServiceControlAccept::SHUTDOWN
                | ServiceControlAccept::SESSION_CHANGE
        }
    };

    status_handle
        .set_service_status(ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: state,
            controls_accepted,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint,
            process_id: None,
        })
        .context("failed to set service status")?;
    Ok(())
}

pub fn install() -> Result<()> {
    info!("installing service: {}", SERVICE_NAME);

    let service_binary_path =
        std::env::current_exe().context("failed to get executable path")?;

    let manager = ServiceManager::local_computer(
        None::<&std::ffi::OsStr>,
        ServiceManagerAccess::CREATE_SERVICE,
    )
    .context("failed to open service manager")?;

    let service_info = ServiceInfo {
        name: OsString::from(SERVICE_NAME),
        display_name: OsString::from(SERVICE_DISPLAY_NAME),
        service_type: ServiceType::OWN_PROCESS,
        start_type: ServiceStartType::AutoStart,
        error_control: ServiceErrorControl::Normal,
        executable_path: service_binary_path,
        launch_arguments: vec![],
        dependencies: vec![],
        account_name: None, // LocalSystem
        account_password: None,
    };

    manager
        .create_service(&service_info, ServiceAccess::CHANGE_CONFIG)
        .context("failed to create service")?;
    Ok(())
}

pub fn uninstall() -> Result<()> {
    info!("uninstalling service: {}", SERVICE_NAME);

    let manager =
        ServiceManager::local_computer(None::<&std::ffi::OsStr>, ServiceManagerAccess::CONNECT)
            .context("failed to open service manager")?;
    let service = manager
        .open_service(SERVICE_NAME, ServiceAccess::DELETE)
        .context("failed to open service")?;
    service.delete().context("failed to delete service")?;
    Ok(())
}

pub fn start() -> Result<()> {
    let manager =
        ServiceManager::local_computer(None::<&std::ffi::OsStr>, ServiceManagerAccess::CONNECT)
            .context("failed to open service manager")?;
    let service = manager
        .open_service(SERVICE_NAME, ServiceAccess::START)
        .context("failed to open service")?;
    service
        .start::<OsString>(&[])
        .context("failed to start service")?;
    Ok(())
}

pub fn stop() -> Result<()> {
    let manager =
        ServiceManager::local_computer(None::<&std::ffi::OsStr>, ServiceManagerAccess::CONNECT)
            .context("failed to open service manager")?;
    let service = manager
        .open_service(SERVICE_NAME, ServiceAccess::STOP)
        .context("failed to open service")?;
    service.stop().context("failed to stop service")?;
    Ok(())
}

pub fn print_status() -> Result<()> {
    let manager =
        ServiceManager::local_computer(None::<&std::ffi::OsStr>, ServiceManagerAccess::CONNECT)?;

    match manager.open_service(SERVICE_NAME, ServiceAccess::QUERY_STATUS) {
        Ok(service) => {
            let status = service.query_status()?;
            println!("Service: {}", SERVICE_NAME);
            println!("Status:  {:?}", status.current_state);
            println!("PID:     {:?}", status.process_id);
        }
        Err(_) => {
            println!("Service: {}", SERVICE_NAME);
            println!("Status:  Not installed");
        }
    }
    Ok(())
}
