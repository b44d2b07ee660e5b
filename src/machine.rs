use crate::rtmr3;
use crate::tdvf::Tdvf;
use crate::util::debug_print_log;
use crate::{kernel, TdxMeasurements};
use crate::{measure_log, measure_sha384};
use anyhow::{Context, Result};
use fs_err as fs;
use log::debug;

/// The guest configuration whose launch measurements are reproduced.
#[derive(Debug, bon::Builder)]
pub struct Machine<'a> {
    pub cpu_count: u8,
    /// Guest RAM in bytes.
    pub memory_size: u64,
    #[builder(default = "")]
    pub firmware: &'a str,
    #[builder(default = "")]
    pub kernel: &'a str,
    #[builder(default = "")]
    pub initrd: &'a str,
    #[builder(default = "")]
    pub kernel_cmdline: &'a str,
    /// TCB_SVN 6xx firmware adds all of a section's pages before extending
    /// them and logs a trailing RTMR0 separator; 7xx interleaves per page.
    #[builder(default = false)]
    pub two_pass_add_pages: bool,
    /// Directory with `template_qemu_cpu<N>.hex` files; the embedded catalog
    /// is used when unset.
    pub templates_dir: Option<&'a str>,
    /// Rootfs image measured into RTMR3.
    pub rootfs: Option<&'a str>,
    /// Docker-compose file measured into RTMR3.
    pub docker_compose: Option<&'a str>,
    /// Dockerfiles measured into RTMR3, in order.
    #[builder(default)]
    pub dockerfiles: Vec<&'a str>,
}

impl Machine<'_> {
    /// Computes every measurement register for this machine.
    pub fn measure(&self) -> Result<TdxMeasurements> {
        debug!("measuring machine: {self:#?}");
        let fw_data = fs::read(self.firmware)?;
        let kernel_data = fs::read(self.kernel)?;
        let initrd_data = if self.initrd.is_empty() {
            Vec::new()
        } else {
            fs::read(self.initrd)?
        };
        let tdvf = Tdvf::parse(&fw_data).context("Failed to parse TDVF metadata")?;
        let mrtd = tdvf.mrtd(self).context("Failed to compute MR TD")?;
        let rtmr0 = tdvf.rtmr0(self).context("Failed to compute RTMR0")?;
        let rtmr1 = kernel::measure_kernel(
            &kernel_data,
            initrd_data.len() as u32,
            self.memory_size,
            0x28000,
        )?;

        let rtmr2_log = vec![
            kernel::measure_cmdline(self.kernel_cmdline),
            measure_sha384(&initrd_data),
        ];
        debug_print_log("RTMR2", &rtmr2_log);
        let rtmr2 = measure_log(&rtmr2_log);

        let rtmr3 = rtmr3::measure_rtmr3(self).context("Failed to compute RTMR3")?;

        Ok(TdxMeasurements {
            mrtd,
            rtmr0,
            rtmr1,
            rtmr2,
            rtmr3,
        })
    }
}
