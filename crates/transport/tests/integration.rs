//! Integration tests against real hardware. These need a connected
//! security key and are ignored by default; run with
//! `cargo test -- --ignored` on a machine with a device attached.

use hwsec_transport::manager::{InlineExecutor, SecurityKeyManager, SystemClock};
use hwsec_transport::CommandApdu;
use serial_test::serial;
use std::sync::Arc;

fn manager() -> SecurityKeyManager {
    SecurityKeyManager::new(Arc::new(InlineExecutor), Arc::new(SystemClock))
}

#[test]
#[serial]
#[ignore = "needs a connected security key"]
fn enumerates_attached_keys() {
    let manager = manager();
    manager.poll_usb_once();
    for key in manager.managed_keys() {
        println!("{} over {:?}", key.id, key.transport.kind());
    }
}

#[test]
#[serial]
#[ignore = "needs a connected security key"]
fn selects_openpgp_applet() {
    let manager = manager();
    manager.poll_usb_once();
    let key = manager
        .managed_keys()
        .into_iter()
        .next()
        .expect("no security key attached");
    let select = CommandApdu::new(
        0x00,
        0xA4,
        0x04,
        0x00,
        vec![0xD2, 0x76, 0x00, 0x01, 0x24, 0x01],
        256,
    );
    let rsp = key.transport.transceive(&select).expect("exchange failed");
    println!("SW = {:04x}", rsp.sw);
}
