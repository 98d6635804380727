//! Session lifecycle tests on the simulated fabric
//!
//! Every test builds a bitstream + handoff pair in a scratch directory and
//! drives it end to end through `AcceleratorSession`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use xcel_driver::backends::{SimulationProbe, SoftwareConfig, SoftwarePlatform};
use xcel_driver::prelude::*;
use xcel_driver::{CancelToken, SyncState};

/// Register list as Vivado writes it for `profile`, low and high pointer words included.
fn registers(profile: Profile) -> Vec<(&'static str, usize)> {
    match profile {
        Profile::VectorAdd => vec![
            ("CTRL", 0x00),
            ("GIER", 0x04),
            ("IP_IER", 0x08),
            ("IP_ISR", 0x0C),
            ("a_1", 0x10),
            ("a_2", 0x14),
            ("b_1", 0x1C),
            ("b_2", 0x20),
            ("c_1", 0x28),
            ("c_2", 0x2C),
            ("n", 0x34),
        ],
        Profile::VectorDot => vec![
            ("CTRL", 0x00),
            ("a_1", 0x10),
            ("a_2", 0x14),
            ("b_1", 0x1C),
            ("b_2", 0x20),
            ("n", 0x28),
            ("result", 0x30),
            ("result_ap_vld", 0x34),
        ],
    }
}

fn handoff_xml(modules: &[(&str, Profile, Vec<(&str, usize)>)]) -> String {
    let mut ranges = String::new();
    let mut body = String::new();
    for (i, (instance, profile, regs)) in modules.iter().enumerate() {
        let base = 0x43C0_0000 + 0x1_0000 * i;
        ranges.push_str(&format!(
            r#"<MEMRANGE BASEVALUE="{base:#X}" HIGHVALUE="{:#X}" INSTANCE="{instance}" MEMTYPE="REGISTER"/>"#,
            base + 0xFFFF
        ));
        let regs: String = regs
            .iter()
            .map(|(name, offset)| {
                format!(
                    r#"<REGISTER NAME="{name}"><PROPERTY NAME="ADDRESS_OFFSET" VALUE="{offset}"/><PROPERTY NAME="SIZE" VALUE="32"/></REGISTER>"#
                )
            })
            .collect();
        body.push_str(&format!(
            r#"<MODULE INSTANCE="{instance}" MODTYPE="{kernel}" VLNV="xilinx.com:hls:{kernel}:1.0"><REGISTERS>{regs}</REGISTERS></MODULE>"#,
            kernel = profile.kernel()
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<EDKSYSTEM EDWVERSION="1.2">
  <MODULES>
    <MODULE INSTANCE="processing_system7_0" MODTYPE="processing_system7">
      <MEMORYMAP>{ranges}</MEMORYMAP>
    </MODULE>
    {body}
  </MODULES>
</EDKSYSTEM>"#
    )
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Write `<stem>.bit` and, if given, `<stem>.hwh`.
    fn image(&self, stem: &str, handoff: Option<&str>) -> PathBuf {
        let image = self.dir.path().join(format!("{stem}.bit"));
        std::fs::write(&image, b"\x00\x09\x0f\xf0bitstream").unwrap();
        if let Some(text) = handoff {
            std::fs::write(image.with_extension("hwh"), text).unwrap();
        }
        image
    }

    fn standard(&self, profile: Profile) -> PathBuf {
        let xml = handoff_xml(&[(profile.instance_name(), profile, registers(profile))]);
        self.image(profile.kernel(), Some(&xml))
    }
}

fn session_with(
    profile: Profile,
    sim: SoftwareConfig,
    configure: impl FnOnce(SessionConfig) -> SessionConfig,
) -> (AcceleratorSession, SimulationProbe) {
    let platform = SoftwarePlatform::new(sim);
    let probe = platform.probe();
    let config = configure(SessionConfig::new(profile));
    (AcceleratorSession::new(Box::new(platform), config), probe)
}

fn session(profile: Profile) -> (AcceleratorSession, SimulationProbe) {
    session_with(profile, SoftwareConfig::default(), |c| c)
}

fn programmed(fixture: &Fixture, profile: Profile) -> (AcceleratorSession, SimulationProbe) {
    let (mut s, probe) = session(profile);
    s.program(fixture.standard(profile)).unwrap();
    (s, probe)
}

#[test]
fn vector_add_small() {
    let fixture = Fixture::new();
    let (mut s, probe) = programmed(&fixture, Profile::VectorAdd);
    assert_eq!(s.state(), SessionState::Programmed);

    s.load_inputs(&[1.0f32, 2.0, 3.0], &[4.0f32, 5.0, 6.0]).unwrap();
    assert_eq!(s.state(), SessionState::InputsLoaded);
    s.allocate_output(3).unwrap();
    assert_eq!(s.state(), SessionState::OutputAllocated);

    let report = s.run().unwrap();
    let c = report.output.vector().unwrap();
    assert_eq!(c.to_vec::<f32>().unwrap(), [5.0, 7.0, 9.0]);
    assert_eq!(c.sync_state(), SyncState::Clean);
    assert!(report.elapsed >= Duration::ZERO);
    assert_eq!(report.polls, u64::from(SoftwareConfig::default().completion_polls) + 1);

    assert_eq!(probe.launches(), 1);
    assert_eq!(s.state(), SessionState::OutputAllocated);
}

#[test]
fn vector_add_matches_host_arithmetic() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorAdd);

    let n = 4096;
    let a: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
    let b: Vec<f32> = (0..n).map(|i| 1000.0 - i as f32).collect();
    s.load_inputs(&a, &b).unwrap();
    s.allocate_output(n).unwrap();
    let report = s.run().unwrap();
    let c = report.output.vector().unwrap().as_slice::<f32>().unwrap();
    for i in 0..n {
        assert_eq!(c[i], a[i] + b[i], "element {i}");
    }
}

#[test]
fn vector_dot_small() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorDot);
    s.load_inputs(&[1i32, 2, 3], &[4i32, 5, 6]).unwrap();
    let report = s.run().unwrap();
    assert_eq!(report.output.scalar(), Some(32));
    assert!(report.output.vector().is_none());
}

#[test]
fn vector_dot_negative_result() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorDot);
    s.load_inputs(&[-3i32, 2], &[5i32, 1]).unwrap();
    assert_eq!(s.run().unwrap().output.scalar(), Some(-13));
}

#[test]
fn missing_handoff_fails_before_register_access() {
    let fixture = Fixture::new();
    let image = fixture.image("orphan", None);
    let (mut s, probe) = session(Profile::VectorAdd);

    let err = s.program(&image).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("orphan.hwh"), "{err}");
    assert_eq!(probe.register_accesses(), 0);
    assert_eq!(s.state(), SessionState::Unprogrammed);
}

#[test]
fn missing_image_is_configuration_error() {
    let (mut s, probe) = session(Profile::VectorAdd);
    let err = s.program(Path::new("/nonexistent/vvadd.bit")).unwrap_err();
    assert!(matches!(err, XcelError::MissingArtifact { what: "bitstream", .. }));
    assert_eq!(probe.register_accesses(), 0);
}

#[test]
fn program_resets_control_once() {
    let fixture = Fixture::new();
    let (_s, probe) = programmed(&fixture, Profile::VectorAdd);
    assert_eq!(probe.register_writes(), 1);
    assert_eq!(probe.register_reads(), 0);
    assert_eq!(probe.launches(), 0);
}

#[test]
fn second_program_is_rejected() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorAdd);
    let err = s.program(fixture.standard(Profile::VectorAdd)).unwrap_err();
    assert!(matches!(err, XcelError::AlreadyProgrammed { .. }));
    assert_eq!(s.state(), SessionState::Programmed);
}

#[test]
fn not_ready_before_program() {
    let (mut s, _probe) = session(Profile::VectorAdd);
    let err = s.load_inputs(&[1.0f32], &[2.0f32]).unwrap_err();
    assert!(matches!(err, XcelError::NotReady { .. }));
    assert!(matches!(
        s.allocate_output(1).unwrap_err(),
        XcelError::NotReady { .. }
    ));
}

#[test]
fn length_mismatch_is_shape_error() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorAdd);
    let err = s.load_inputs(&[1.0f32, 2.0], &[1.0f32]).unwrap_err();
    assert!(matches!(err, XcelError::Shape { .. }));
    assert_eq!(s.state(), SessionState::Programmed);
}

#[test]
fn element_type_rules() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorAdd);

    let err = s.load_inputs(&[1.0f32, 2.0], &[1i32, 2]).unwrap_err();
    assert!(matches!(err, XcelError::Type { .. }));

    let err = s.load_inputs(&[1.0f64, 2.0], &[1.0f64, 2.0]).unwrap_err();
    match err {
        XcelError::Type { expected, actual } => {
            assert_eq!(expected, ElementType::F32);
            assert_eq!(actual, ElementType::F64);
        }
        other => panic!("expected type error, got {other}"),
    }
}

#[test]
fn empty_inputs_are_invalid() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorAdd);
    let empty: [f32; 0] = [];
    let err = s.load_inputs(&empty, &empty).unwrap_err();
    assert!(matches!(err, XcelError::InvalidValue { .. }));
}

#[test]
fn allocate_output_rules() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorAdd);

    assert!(matches!(
        s.allocate_output(0).unwrap_err(),
        XcelError::InvalidValue { .. }
    ));
    assert!(matches!(
        s.allocate_output(3).unwrap_err(),
        XcelError::NotReady { .. }
    ));

    s.load_inputs(&[1.0f32, 2.0, 3.0], &[1.0f32, 2.0, 3.0]).unwrap();
    assert!(matches!(
        s.allocate_output(4).unwrap_err(),
        XcelError::Shape { .. }
    ));
    assert!(matches!(
        s.allocate_output(0).unwrap_err(),
        XcelError::InvalidValue { .. }
    ));
    let c = s.allocate_output(3).unwrap();
    assert_eq!(c.element_type(), ElementType::F32);
}

#[test]
fn scalar_profile_has_no_output_buffer() {
    let fixture = Fixture::new();
    let (mut s, _probe) = programmed(&fixture, Profile::VectorDot);
    s.load_inputs(&[1i32], &[1i32]).unwrap();
    let err = s.allocate_output(1).unwrap_err();
    assert!(matches!(err, XcelError::UnsupportedOperation { .. }));
}

#[test]
fn run_requires_output_on_vector_profile() {
    let fixture = Fixture::new();
    let (mut s, probe) = programmed(&fixture, Profile::VectorAdd);
    s.load_inputs(&[1.0f32], &[1.0f32]).unwrap();
    assert!(matches!(s.run().unwrap_err(), XcelError::NotReady { .. }));
    assert_eq!(probe.launches(), 0);
}

#[test]
fn hung_accelerator_times_out() {
    let fixture = Fixture::new();
    let sim = SoftwareConfig {
        hang: true,
        ..SoftwareConfig::default()
    };
    let (mut s, _probe) = session_with(Profile::VectorDot, sim, |c| {
        c.with_timeout(Duration::from_millis(25))
    });
    s.program(fixture.standard(Profile::VectorDot)).unwrap();
    s.load_inputs(&[1i32, 2], &[3i32, 4]).unwrap();

    let err = s.run().unwrap_err();
    match err {
        XcelError::Timeout { duration_ms, polls } => {
            assert_eq!(duration_ms, 25);
            assert!(polls >= 1);
        }
        other => panic!("expected timeout, got {other}"),
    }
}

#[test]
fn cancelled_wait() {
    let fixture = Fixture::new();
    let token = CancelToken::new();
    let sim = SoftwareConfig {
        hang: true,
        ..SoftwareConfig::default()
    };
    let wait = WaitPolicy::unbounded().with_cancel(token.clone());
    let (mut s, _probe) = session_with(Profile::VectorDot, sim, |c| c.with_wait(wait));
    s.program(fixture.standard(Profile::VectorDot)).unwrap();
    s.load_inputs(&[1i32], &[1i32]).unwrap();

    token.cancel();
    assert!(matches!(s.run().unwrap_err(), XcelError::Cancelled { .. }));
}

#[test]
fn shifted_register_in_handoff_is_detected() {
    let fixture = Fixture::new();
    let mut regs = registers(Profile::VectorAdd);
    for entry in &mut regs {
        if entry.0 == "n" {
            entry.1 = 0x38;
        }
    }
    let xml = handoff_xml(&[("vvadd_0", Profile::VectorAdd, regs)]);
    let image = fixture.image("shifted", Some(&xml));
    let (mut s, probe) = session(Profile::VectorAdd);

    let err = s.program(&image).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("register n"), "{err}");
    assert_eq!(probe.register_accesses(), 0);
}

#[test]
fn missing_instance_in_handoff() {
    let fixture = Fixture::new();
    let xml = handoff_xml(&[("vvdot_0", Profile::VectorDot, registers(Profile::VectorDot))]);
    let image = fixture.image("dot_only", Some(&xml));
    let (mut s, _probe) = session(Profile::VectorAdd);
    let err = s.program(&image).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("vvadd_0"));
}

#[test]
fn instance_of_another_kernel_is_rejected() {
    let fixture = Fixture::new();
    let image = fixture.standard(Profile::VectorAdd);
    let (mut s, _probe) = session_with(Profile::VectorDot, SoftwareConfig::default(), |c| {
        c.with_instance("vvadd_0")
    });
    assert!(s.program(&image).unwrap_err().is_configuration());
}

#[test]
fn explicit_instance_binding() {
    let fixture = Fixture::new();
    let xml = handoff_xml(&[
        ("vvadd_0", Profile::VectorAdd, registers(Profile::VectorAdd)),
        ("vvadd_1", Profile::VectorAdd, registers(Profile::VectorAdd)),
    ]);
    let image = fixture.image("dual", Some(&xml));
    let (mut s, _probe) = session_with(Profile::VectorAdd, SoftwareConfig::default(), |c| {
        c.with_instance("vvadd_1")
    });
    s.program(&image).unwrap();
    s.load_inputs(&[1.5f32], &[2.5f32]).unwrap();
    s.allocate_output(1).unwrap();
    let report = s.run().unwrap();
    assert_eq!(report.output.vector().unwrap().read::<f32>(0).unwrap(), 4.0);
}

#[test]
fn pool_exhaustion_is_allocation_error() {
    let fixture = Fixture::new();
    let sim = SoftwareConfig {
        memory_bytes: 2 * 4096,
        ..SoftwareConfig::default()
    };
    let (mut s, _probe) = session_with(Profile::VectorAdd, sim, |c| c);
    s.program(fixture.standard(Profile::VectorAdd)).unwrap();

    let a = vec![1.0f32; 1024];
    s.load_inputs(&a, &a).unwrap();
    let err = s.allocate_output(1024).unwrap_err();
    assert!(matches!(err, XcelError::Allocation { .. }), "{err}");
    assert_eq!(s.state(), SessionState::InputsLoaded);
}

#[test]
fn reload_of_new_length_releases_old_buffers_first() {
    let fixture = Fixture::new();
    let sim = SoftwareConfig::default().with_memory_bytes(3 * 4096);
    let (mut s, probe) = session_with(Profile::VectorAdd, sim, |c| c);
    s.program(fixture.standard(Profile::VectorAdd)).unwrap();

    s.load_inputs(&[1.0f32, 2.0, 3.0], &[4.0f32, 5.0, 6.0]).unwrap();
    s.allocate_output(3).unwrap();
    assert_eq!(probe.memory().bytes_in_use(), 3 * 4096);

    s.load_inputs(&[1.0f32; 4], &[2.0f32; 4]).unwrap();
    assert_eq!(s.state(), SessionState::InputsLoaded);
    assert_eq!(s.input_len(), Some(4));
    s.allocate_output(4).unwrap();
    let report = s.run().unwrap();
    assert_eq!(report.output.vector().unwrap().to_vec::<f32>().unwrap(), vec![3.0; 4]);
}

#[test]
fn failed_reload_leaves_session_programmed() {
    let fixture = Fixture::new();
    let sim = SoftwareConfig::default().with_memory_bytes(3 * 4096);
    let (mut s, probe) = session_with(Profile::VectorAdd, sim, |c| c);
    s.program(fixture.standard(Profile::VectorAdd)).unwrap();

    s.load_inputs(&[1.0f32, 2.0, 3.0], &[4.0f32, 5.0, 6.0]).unwrap();
    s.allocate_output(3).unwrap();

    let big = vec![1.0f32; 2048];
    let err = s.load_inputs(&big, &big).unwrap_err();
    assert!(matches!(err, XcelError::Allocation { .. }), "{err}");
    assert_eq!(s.state(), SessionState::Programmed);
    assert_eq!(s.input_len(), None);
    assert!(s.output().is_none());
    assert_eq!(probe.memory().bytes_in_use(), 0);
    assert!(matches!(s.run().unwrap_err(), XcelError::NotReady { .. }));
}

#[test]
fn rerun_with_new_inputs() {
    let fixture = Fixture::new();
    let (mut s, probe) = programmed(&fixture, Profile::VectorAdd);

    s.load_inputs(&[1.0f32, 1.0], &[1.0f32, 1.0]).unwrap();
    let address = s.allocate_output(2).unwrap().address();
    let first = s.run().unwrap().output.vector().unwrap().to_vec::<f32>().unwrap();
    assert_eq!(first, [2.0, 2.0]);

    // Same length: buffers are reused in place.
    s.load_inputs(&[10.0f32, 20.0], &[0.5f32, 0.25]).unwrap();
    assert_eq!(s.state(), SessionState::OutputAllocated);
    assert_eq!(s.output().unwrap().address(), address);
    let second = s.run().unwrap().output.vector().unwrap().to_vec::<f32>().unwrap();
    assert_eq!(second, [10.5, 20.25]);

    // New length: the stale output is released.
    s.load_inputs(&[1.0f32, 2.0, 3.0], &[1.0f32, 2.0, 3.0]).unwrap();
    assert_eq!(s.state(), SessionState::InputsLoaded);
    assert_eq!(s.input_len(), Some(3));
    s.allocate_output(3).unwrap();
    let third = s.run().unwrap().output.vector().unwrap().to_vec::<f32>().unwrap();
    assert_eq!(third, [2.0, 4.0, 6.0]);

    assert_eq!(probe.launches(), 3);
}

#[test]
fn rerun_without_new_inputs() {
    let fixture = Fixture::new();
    let (mut s, probe) = programmed(&fixture, Profile::VectorDot);
    s.load_inputs(&[2i32, 2], &[3i32, 3]).unwrap();
    assert_eq!(s.run().unwrap().output.scalar(), Some(12));
    assert_eq!(s.run().unwrap().output.scalar(), Some(12));
    assert_eq!(probe.launches(), 2);
}

#[test]
fn dropping_session_releases_device_memory() {
    let fixture = Fixture::new();
    let (mut s, probe) = programmed(&fixture, Profile::VectorAdd);
    s.load_inputs(&[1.0f32; 100], &[1.0f32; 100]).unwrap();
    s.allocate_output(100).unwrap();
    assert_eq!(probe.memory().mapped_regions(), 3);

    drop(s);
    assert_eq!(probe.memory().mapped_regions(), 0);
    assert_eq!(probe.memory().bytes_in_use(), 0);
}

#[test]
fn register_map_exposed_after_program() {
    let fixture = Fixture::new();
    let (s, _probe) = programmed(&fixture, Profile::VectorDot);
    let map = s.register_map().unwrap();
    assert_eq!(map.offset_of("length").unwrap(), 0x28);
    assert_eq!(map.offset_of("result").unwrap(), 0x30);
    assert!(map.offset_of("operand_c").is_err());
    assert_eq!(s.image().unwrap().file_name().unwrap(), "vvdot.bit");
}
