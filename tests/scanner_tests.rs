mod common;

use common::{addr, app_cred, admin_cred, scanner, test_settings, MockProber, LOCAL};
use lan_role_rs::scanner::best_server;
use lan_role_rs::types::ProbeStatus;

#[tokio::test]
async fn pooled_scan_probes_each_address_once() {
    let settings = test_settings();
    let s = scanner(MockProber::new().with_server(addr(50), app_cred(), &["appdb"]), &settings);

    let results = s.scan_range(1, 254, None, false).await;

    assert_eq!(results.scanned_total, 254);
    assert_eq!(results.scanned_done, 254);
    assert_eq!(results.len(), 254);
    assert_eq!(s.prober().total_probes(), 254);
    assert!(s.prober().probed_addresses().values().all(|&n| n == 1));
    assert_eq!(results.found_count, 1);
}

#[tokio::test]
async fn sequential_scan_probes_each_address_once_in_order() {
    let settings = test_settings();
    let s = scanner(MockProber::new(), &settings);

    let results = s.scan_range(10, 20, Some(addr(15)), true).await;

    assert_eq!(s.prober().total_probes(), 10);
    assert_eq!(s.prober().probe_count(addr(15)), 0);
    let order: Vec<_> = results.entries().iter().map(|e| e.address).collect();
    let expected: Vec<_> = (10..=20).filter(|o| *o != 15).map(addr).collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn excluded_address_never_appears_even_when_reachable() {
    let settings = test_settings();
    let prober = MockProber::new()
        .with_server(LOCAL, app_cred(), &["appdb"])
        .with_server(addr(60), admin_cred(), &["postgres"]);
    let s = scanner(prober, &settings);

    for fast in [false, true] {
        let results = s.scan_range(1, 254, Some(LOCAL), fast).await;
        assert!(results.get(LOCAL).is_none());
        assert_eq!(results.len(), 253);
        assert_eq!(results.found_count, 1);
    }
    assert_eq!(s.prober().probe_count(LOCAL), 0);
}

#[tokio::test]
async fn port_open_hosts_are_not_servers() {
    let settings = test_settings();
    let s = scanner(MockProber::new().with_open_port(addr(5)), &settings);

    let results = s.scan_range(1, 10, None, false).await;

    assert_eq!(results.get(addr(5)).unwrap().status, ProbeStatus::PortOpen);
    assert!(best_server(&results, "app_user").is_none());
}

#[tokio::test]
async fn quick_scan_stops_at_first_server() {
    let settings = test_settings();
    let prober = MockProber::new()
        .with_server(addr(10), admin_cred(), &["postgres"])
        .with_server(addr(100), app_cred(), &["appdb"]);
    let s = scanner(prober, &settings);

    let found = s.quick_scan(None).await.unwrap();

    assert_eq!(found.address, addr(10));
    assert_eq!(s.prober().probe_count(addr(1)), 1);
    assert_eq!(s.prober().probe_count(addr(50)), 0);
    assert_eq!(s.prober().probe_count(addr(100)), 0);
}

#[tokio::test]
async fn quick_scan_skips_excluded_address() {
    let settings = test_settings();
    let s = scanner(MockProber::new().with_server(addr(1), app_cred(), &["appdb"]), &settings);

    assert!(s.quick_scan(Some(addr(1))).await.is_none());
    assert_eq!(s.prober().probe_count(addr(1)), 0);
    assert_eq!(s.prober().total_probes(), 4);
}
