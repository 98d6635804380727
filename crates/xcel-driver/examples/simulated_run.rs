//! Drive both kernels on the simulated fabric.
//!
//! Writes a throwaway bitstream and handoff, then programs, loads, runs and
//! reads back exactly as on a board.

use std::fmt::Write as _;
use xcel_driver::backends::{SoftwareConfig, SoftwarePlatform};
use xcel_driver::prelude::*;

fn handoff(profile: Profile) -> String {
    let registers: &[(&str, usize)] = match profile {
        Profile::VectorAdd => &[
            ("CTRL", 0x00),
            ("a_1", 0x10),
            ("b_1", 0x1C),
            ("c_1", 0x28),
            ("n", 0x34),
        ],
        Profile::VectorDot => &[
            ("CTRL", 0x00),
            ("a_1", 0x10),
            ("b_1", 0x1C),
            ("n", 0x28),
            ("result", 0x30),
        ],
    };
    let mut regs = String::new();
    for (name, offset) in registers {
        let _ = write!(
            regs,
            r#"<REGISTER NAME="{name}"><PROPERTY NAME="ADDRESS_OFFSET" VALUE="{offset}"/></REGISTER>"#
        );
    }
    format!(
        r#"<EDKSYSTEM><MODULES><MODULE INSTANCE="{}" MODTYPE="{}">{regs}</MODULE></MODULES></EDKSYSTEM>"#,
        profile.instance_name(),
        profile.kernel()
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("xcel_driver=info")
        .init();

    let dir = tempfile::TempDir::new()?;

    for profile in Profile::ALL {
        let image = dir.path().join(format!("{}.bit", profile.kernel()));
        std::fs::write(&image, b"simulated")?;
        std::fs::write(image.with_extension("hwh"), handoff(profile))?;

        let platform = SoftwarePlatform::new(SoftwareConfig::default());
        let mut session = AcceleratorSession::new(Box::new(platform), SessionConfig::new(profile));
        session.program(&image)?;

        match profile {
            Profile::VectorAdd => {
                session.load_inputs(&[1.0f32, 2.0, 3.0], &[4.0f32, 5.0, 6.0])?;
                session.allocate_output(3)?;
                let report = session.run()?;
                if let Some(c) = report.output.vector() {
                    println!("vvadd -> {:?} ({} polls)", c.to_vec::<f32>()?, report.polls);
                }
            }
            Profile::VectorDot => {
                session.load_inputs(&[1i32, 2, 3], &[4i32, 5, 6])?;
                let report = session.run()?;
                println!("vvdot -> {:?} ({} polls)", report.output.scalar(), report.polls);
            }
        }
    }
    Ok(())
}
