use std::ffi::CString;
use std::ptr;

use anyhow::{Context, Result};
use esp_idf_sys::{
    esp, esp_vfs_fat_sdcard_unmount, esp_vfs_fat_sdmmc_mount_config_t, esp_vfs_fat_sdspi_mount,
    sdmmc_card_t, sdmmc_host_t, sdspi_device_config_t, sdspi_host_do_transaction,
    sdspi_host_get_real_freq, sdspi_host_init, sdspi_host_io_int_enable, sdspi_host_io_int_wait,
    sdspi_host_remove_device, sdspi_host_set_card_clk, spi_bus_config_t, spi_bus_free,
    spi_bus_initialize, spi_common_dma_t_SPI_DMA_CH_AUTO, spi_host_device_t,
    spi_host_device_t_SPI2_HOST, SDMMC_FREQ_DEFAULT, SDMMC_HOST_FLAG_DEINIT_ARG,
    SDMMC_HOST_FLAG_SPI,
};
use log::{info, warn};

use crate::config::MOUNT_POINT;
use crate::storage::Unmount;

const PIN_MISO: i32 = 35;
const PIN_MOSI: i32 = 34;
const PIN_CLK: i32 = 36;
const PIN_CS: i32 = 33;

/// FAT volume on the SD card, attached over SPI2.
pub struct SdCard {
    base: CString,
    card: *mut sdmmc_card_t,
    host: spi_host_device_t,
}

unsafe impl Send for SdCard {}

pub fn mount() -> Result<SdCard> {
    let host_id = spi_host_device_t_SPI2_HOST;

    let mut bus = spi_bus_config_t {
        sclk_io_num: PIN_CLK,
        max_transfer_sz: 4000,
        ..Default::default()
    };
    bus.__bindgen_anon_1.mosi_io_num = PIN_MOSI;
    bus.__bindgen_anon_2.miso_io_num = PIN_MISO;
    bus.__bindgen_anon_3.quadwp_io_num = -1;
    bus.__bindgen_anon_4.quadhd_io_num = -1;

    let mut host = sdmmc_host_t {
        flags: SDMMC_HOST_FLAG_SPI | SDMMC_HOST_FLAG_DEINIT_ARG,
        slot: host_id as i32,
        max_freq_khz: SDMMC_FREQ_DEFAULT as i32,
        io_voltage: 3.3,
        init: Some(sdspi_host_init),
        set_card_clk: Some(sdspi_host_set_card_clk),
        do_transaction: Some(sdspi_host_do_transaction),
        io_int_enable: Some(sdspi_host_io_int_enable),
        io_int_wait: Some(sdspi_host_io_int_wait),
        get_real_freq: Some(sdspi_host_get_real_freq),
        ..Default::default()
    };
    host.__bindgen_anon_1.deinit_p = Some(sdspi_host_remove_device);

    let slot = sdspi_device_config_t {
        host_id,
        gpio_cs: PIN_CS,
        gpio_cd: -1,
        gpio_wp: -1,
        gpio_int: -1,
        ..Default::default()
    };

    let mount_config = esp_vfs_fat_sdmmc_mount_config_t {
        format_if_mount_failed: false,
        max_files: 5,
        allocation_unit_size: 16 * 1024,
        ..Default::default()
    };

    let base = CString::new(MOUNT_POINT)?;
    let mut card: *mut sdmmc_card_t = ptr::null_mut();

    esp!(unsafe { spi_bus_initialize(host_id, &bus, spi_common_dma_t_SPI_DMA_CH_AUTO) })
        .context("SPI bus init")?;

    let mounted = esp!(unsafe {
        esp_vfs_fat_sdspi_mount(base.as_ptr(), &host, &slot, &mount_config, &mut card)
    });
    if let Err(e) = mounted {
        unsafe { spi_bus_free(host_id) };
        return Err(e).context("SD card mount");
    }

    info!("SD card mounted at {MOUNT_POINT}");
    Ok(SdCard {
        base,
        card,
        host: host_id,
    })
}

impl Unmount for SdCard {
    fn unmount(&mut self) {
        if self.card.is_null() {
            return;
        }

        if let Err(e) = esp!(unsafe { esp_vfs_fat_sdcard_unmount(self.base.as_ptr(), self.card) }) {
            warn!("SD card unmount: {e:?}");
        }
        unsafe { spi_bus_free(self.host) };
        self.card = ptr::null_mut();
    }
}
