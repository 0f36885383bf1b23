mod common;

use common::HostBuilder;

use sitectl_core::renewal::{SERVICE_UNIT, TIMER_UNIT};
use sitectl_core::SchedulingMechanism;

#[test]
fn test_enable_installs_timer_once() {
    let host = HostBuilder::new().build();
    let scheduler = host.ctx.scheduler();

    assert_eq!(scheduler.status().unwrap(), SchedulingMechanism::None);
    assert_eq!(scheduler.enable().unwrap(), SchedulingMechanism::TimerBased);
    assert_eq!(scheduler.enable().unwrap(), SchedulingMechanism::TimerBased);

    assert_eq!(
        host.runner.count(&["systemctl", "enable", "--now", TIMER_UNIT]),
        1
    );
    let systemd_dir = &host.config.renewal.systemd_dir;
    assert!(systemd_dir.join(TIMER_UNIT).exists());
    let service = std::fs::read_to_string(systemd_dir.join(SERVICE_UNIT)).unwrap();
    assert!(service.contains("renew --quiet"));
    assert!(service.contains("--pre-hook \"systemctl stop nginx apache2\""));
    assert!(host.runner.crontab().is_empty());
}

#[test]
fn test_disable_removes_timer() {
    let host = HostBuilder::new().build();
    let scheduler = host.ctx.scheduler();
    scheduler.enable().unwrap();

    assert_eq!(scheduler.disable().unwrap(), SchedulingMechanism::TimerBased);
    assert_eq!(scheduler.status().unwrap(), SchedulingMechanism::None);
    assert!(!host.config.renewal.systemd_dir.join(TIMER_UNIT).exists());
    assert!(!host.config.renewal.systemd_dir.join(SERVICE_UNIT).exists());

    assert_eq!(scheduler.disable().unwrap(), SchedulingMechanism::None);
}

#[test]
fn test_falls_back_to_cron_without_systemd() {
    let host = HostBuilder::new().build();
    host.runner.fail(&["systemctl", "daemon-reload"]);
    let scheduler = host.ctx.scheduler();

    assert_eq!(scheduler.enable().unwrap(), SchedulingMechanism::PeriodicJob);
    assert_eq!(scheduler.status().unwrap(), SchedulingMechanism::PeriodicJob);
    assert!(!host.config.renewal.systemd_dir.join(TIMER_UNIT).exists());

    let crontab = host.runner.crontab();
    assert!(crontab.starts_with("0 3 * * * "));
    assert!(crontab.contains("certbot renew --quiet"));

    // A second enable sees the cron line and adds nothing
    assert_eq!(scheduler.enable().unwrap(), SchedulingMechanism::PeriodicJob);
    assert_eq!(host.runner.crontab(), crontab);

    assert_eq!(scheduler.disable().unwrap(), SchedulingMechanism::PeriodicJob);
    assert_eq!(scheduler.status().unwrap(), SchedulingMechanism::None);
    assert!(host.runner.crontab().is_empty());
}

#[test]
fn test_enable_fails_when_both_mechanisms_fail() {
    let host = HostBuilder::new().build();
    host.runner.fail(&["systemctl", "daemon-reload"]);
    host.runner.fail(&["crontab", "-"]);

    assert!(host.ctx.scheduler().enable().is_err());
    assert_eq!(
        host.ctx.scheduler().status().unwrap(),
        SchedulingMechanism::None
    );
}

#[test]
fn test_domain_jobs_survive_global_disable() {
    let host = HostBuilder::new().build();
    host.runner.fail(&["systemctl", "daemon-reload"]);
    let scheduler = host.ctx.scheduler();

    assert!(scheduler.setup_domain_renewal("shop.test").unwrap());
    assert!(!scheduler.setup_domain_renewal("shop.test").unwrap());

    // The per-domain line alone is not a global mechanism
    assert_eq!(scheduler.status().unwrap(), SchedulingMechanism::None);

    scheduler.enable().unwrap();
    assert_eq!(host.runner.crontab().lines().count(), 2);

    scheduler.disable().unwrap();
    let crontab = host.runner.crontab();
    assert_eq!(crontab.lines().count(), 1);
    assert!(crontab.contains("sitectl-renew-shop.test.sh"));

    let script = scheduler.domain_script_path("shop.test");
    let content = std::fs::read_to_string(&script).unwrap();
    assert!(content.starts_with("#!/bin/sh\n"));
    assert!(content.contains("--cert-name shop.test"));

    assert!(scheduler.remove_domain_renewal("shop.test").unwrap());
    assert!(!script.exists());
    assert!(host.runner.crontab().is_empty());
    assert!(!scheduler.remove_domain_renewal("shop.test").unwrap());
}

#[test]
fn test_trigger_streams_certbot() {
    let host = HostBuilder::new().build();
    host.ctx.scheduler().trigger(None, true).unwrap();

    let calls = host.runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, "certbot");
    assert_eq!(calls[0].args[0], "renew");
    assert!(calls[0].args.contains(&"--dry-run".to_string()));
    assert!(!calls[0].args.contains(&"--cert-name".to_string()));
}

#[test]
fn test_timer_works_on_hosts_without_cron() {
    let host = HostBuilder::new().build();
    host.runner.missing("crontab");
    let scheduler = host.ctx.scheduler();

    assert_eq!(scheduler.status().unwrap(), SchedulingMechanism::None);
    assert_eq!(scheduler.enable().unwrap(), SchedulingMechanism::TimerBased);
    assert_eq!(
        host.runner.count(&["systemctl", "enable", "--now", TIMER_UNIT]),
        1
    );

    assert_eq!(scheduler.disable().unwrap(), SchedulingMechanism::TimerBased);
    assert_eq!(scheduler.status().unwrap(), SchedulingMechanism::None);
}
