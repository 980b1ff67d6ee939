use std::{sync::Arc, time::Duration};

use espkit::{
    config::{ConnectionConfig, ImageConfig},
    connection::{command::CommandType, SessionState},
    error::ConnectionError,
    flasher::device_io::DeviceFlash,
    Chip,
    Error,
    Flasher,
};
use pretty_assertions::assert_eq;
use tokio::task::JoinSet;

use crate::common::{test_stub, MockDevice, MockOptions, FLASH_SIZE};

mod common;

async fn connect(options: MockOptions, stub: bool) -> (Arc<MockDevice>, Flasher) {
    let device = MockDevice::new(options);
    let stub = stub.then(test_stub);
    let flasher = Flasher::connect_with_stub(device.clone(), ConnectionConfig::default(), stub)
        .await
        .unwrap();

    (device, flasher)
}

#[tokio::test(start_paused = true)]
async fn detects_chip_from_security_info() {
    let (device, flasher) = connect(MockOptions::default(), false).await;

    assert_eq!(flasher.chip(), Chip::Esp32c3);
    assert_eq!(flasher.state(), SessionState::Synced);
    assert!(!flasher.is_stub());

    let info = flasher.security_info().await.unwrap();
    assert_eq!(info.chip_id, Some(5));
    assert_eq!(info.eco_version, Some(3));
    assert_eq!(device.count(CommandType::ReadReg), 0);
    assert_eq!(device.count(CommandType::GetSecurityInfo), 1);
}

#[tokio::test(start_paused = true)]
async fn detects_chip_from_magic_register() {
    let options = MockOptions {
        chip: Chip::Esp32,
        security_info: false,
        ..Default::default()
    };
    let (device, flasher) = connect(options, false).await;

    assert_eq!(flasher.chip(), Chip::Esp32);
    assert_eq!(device.count(CommandType::ReadReg), 1);
    assert!(matches!(
        flasher.security_info().await,
        Err(Error::RomError(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn sync_survives_unanswered_packets() {
    let options = MockOptions {
        ignored_syncs: 7,
        ..Default::default()
    };
    let (device, flasher) = connect(options, false).await;

    assert_eq!(flasher.state(), SessionState::Synced);
    assert_eq!(device.count(CommandType::Sync), 8);
}

#[tokio::test(start_paused = true)]
async fn sync_gives_up() {
    let options = MockOptions {
        ignored_syncs: usize::MAX,
        ..Default::default()
    };
    let device = MockDevice::new(options);
    let result = Flasher::connect(device.clone(), ConnectionConfig::default()).await;

    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::ConnectionFailed))
    ));
    assert_eq!(device.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn loads_stub() {
    let (device, flasher) = connect(MockOptions::default(), true).await;

    assert_eq!(flasher.state(), SessionState::StubLoaded);
    assert!(flasher.is_stub());

    let stub = test_stub();
    let mut expected = stub.text().unwrap().1;
    expected.extend(stub.data().unwrap().1);
    assert_eq!(device.ram(), expected);
    // 0x2000 bytes of text take two blocks of up to 0x1800 bytes, the data one
    assert_eq!(device.count(CommandType::MemData), 3);
    assert_eq!(device.count(CommandType::MemEnd), 1);
    assert_eq!(device.bad_checksums(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejects_bad_stub_handshake() {
    let options = MockOptions {
        handshake: b"NOPE",
        ..Default::default()
    };
    let device = MockDevice::new(options);
    let result =
        Flasher::connect_with_stub(device, ConnectionConfig::default(), Some(test_stub())).await;

    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::InvalidStubHandshake))
    ));
}

#[tokio::test(start_paused = true)]
async fn read_flash_acknowledges_window() {
    let (device, flasher) = connect(MockOptions::default(), true).await;

    let data = flasher.read_flash(0, FLASH_SIZE as u32).await.unwrap();
    assert_eq!(data, device.flash());
    assert_eq!(device.acks(), vec![0x4000, 0x8000, 0xC000, 0x10000]);
    assert!(device.max_unacked() <= 0x4000);

    let data = flasher.read_flash(0x100, 0x1880).await.unwrap();
    assert_eq!(data, device.flash()[0x100..0x1980].to_vec());
}

#[tokio::test(start_paused = true)]
async fn read_flash_checks_digest() {
    let options = MockOptions {
        corrupt_read_digest: true,
        ..Default::default()
    };
    let (_device, flasher) = connect(options, true).await;

    assert!(matches!(
        flasher.read_flash(0x1000, 0x2000).await,
        Err(Error::DigestMismatch(..))
    ));
}

#[tokio::test(start_paused = true)]
async fn read_flash_needs_stub() {
    let (_device, flasher) = connect(MockOptions::default(), false).await;

    assert!(matches!(
        flasher.read_flash(0, 0x100).await,
        Err(Error::StubRequired)
    ));
}

#[tokio::test(start_paused = true)]
async fn write_flash_through_stub() {
    let (device, flasher) = connect(MockOptions::default(), true).await;
    let data: Vec<u8> = (0..0x1800u32).map(|i| (i % 97) as u8).collect();

    flasher.write_flash(0x2000, &data).await.unwrap();

    let flash = device.flash();
    assert_eq!(flash[0x2000..0x3800].to_vec(), data);
    assert!(flash[0x3800..0x4000].iter().all(|b| *b == 0xFF));
    assert_eq!(device.count(CommandType::FlashMd5), 1);
    assert_eq!(device.bad_checksums(), 0);
}

#[tokio::test(start_paused = true)]
async fn write_flash_through_rom() {
    let (device, flasher) = connect(MockOptions::default(), false).await;
    let data = vec![0x5A; 0x500];

    flasher.write_flash(0x8000, &data).await.unwrap();
    flasher.finish(false).await.unwrap();

    assert_eq!(device.flash()[0x8000..0x8500].to_vec(), data);
    // 0x400 byte blocks for the ROM loader
    assert_eq!(device.count(CommandType::FlashData), 2);
    assert_eq!(device.count(CommandType::FlashEnd), 1);
}

#[tokio::test(start_paused = true)]
async fn erases_region() {
    let (device, flasher) = connect(MockOptions::default(), true).await;

    flasher.erase_region(0x3000, 0x1000).await.unwrap();

    let flash = device.flash();
    assert!(flash[0x3000..0x4000].iter().all(|b| *b == 0xFF));
    assert_ne!(flash[0x2FFF], 0xFF);
}

#[tokio::test(start_paused = true)]
async fn announces_configured_flash_size() {
    let config = ConnectionConfig {
        flash_size: Some(0x40_0000),
        ..Default::default()
    };
    let device = MockDevice::new(MockOptions::default());
    Flasher::connect(device.clone(), config).await.unwrap();

    assert_eq!(device.count(CommandType::SpiAttach), 1);
    assert_eq!(device.count(CommandType::SpiSetParams), 1);

    let (device, _flasher) = connect(MockOptions::default(), false).await;
    assert_eq!(device.count(CommandType::SpiSetParams), 0);
}

#[tokio::test(start_paused = true)]
async fn changes_baud_rate() {
    let (device, flasher) = connect(MockOptions::default(), true).await;

    flasher.change_baud(921_600).await.unwrap();
    assert_eq!(device.baud(), Some(921_600));
}

#[tokio::test(start_paused = true)]
async fn concurrent_commands_run_one_at_a_time() {
    let options = MockOptions {
        latency: Some(Duration::from_millis(5)),
        ..Default::default()
    };
    let (device, flasher) = connect(options, false).await;
    let flasher = Arc::new(flasher);

    let mut tasks = JoinSet::new();
    for i in 0..8u32 {
        let flasher = flasher.clone();
        tasks.spawn(async move {
            match i % 2 {
                0 => flasher.read_reg(0x6000_8000 + i * 4).await.map(|_| ()),
                _ => flasher.checksum_md5(i * 0x1000, 0x1000).await.map(|_| ()),
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(device.interleaved(), 0);
    assert_eq!(device.count(CommandType::ReadReg), 4);
    assert_eq!(device.count(CommandType::FlashMd5), 4);
}

#[tokio::test(start_paused = true)]
async fn device_backed_image() {
    let (device, flasher) = connect(MockOptions::default(), true).await;
    let original = device.flash();
    let image = DeviceFlash::image(Arc::new(flasher), FLASH_SIZE as u32, &ImageConfig::default());

    let bytes = image.read(0x1FF0, 0x20).await.unwrap();
    assert_eq!(bytes, original[0x1FF0..0x2010].to_vec());

    image.write(0x5002, b"hello").unwrap();
    assert!(image.is_dirty());
    assert_eq!(device.flash(), original);

    image.flush().await.unwrap();
    assert!(!image.is_dirty());

    let flash = device.flash();
    assert_eq!(&flash[0x5002..0x5007], b"hello");
    assert_eq!(flash[0x5000..0x5002], original[0x5000..0x5002]);
    assert_eq!(flash[0x5007..0x6000], original[0x5007..0x6000]);
    assert_eq!(image.read(0x5000, 8).await.unwrap(), flash[0x5000..0x5008].to_vec());
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let (device, flasher) = connect(MockOptions::default(), false).await;

    flasher.disconnect().await.unwrap();
    flasher.disconnect().await.unwrap();

    assert_eq!(device.closes(), 1);
    assert_eq!(flasher.state(), SessionState::Disconnected);
    assert!(matches!(
        flasher.read_reg(0x6000_8000).await,
        Err(Error::Connection(ConnectionError::Disconnected))
    ));
}
