//! # Symmetric-Components Fault Solver
//!
//! Closed-form fault network solver producing per-phase voltage and current
//! phasors for the ten classical shunt faults. Works in sequence quantities
//! with `a = e^(j 120 deg)`: single-line-to-ground connects the three
//! sequence networks in series, line-to-line uses positive and negative only,
//! double-line-to-ground parallels the negative and zero branches, and the
//! balanced three-phase fault collapses to the positive network.
//!
//! Faults are solved in a reference position (AG, BC, BCG) and rotated onto
//! the requested phases. Angles are radians internally; callers convert to
//! degrees at the serialization edge.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shunt fault classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultType {
    AG,
    BG,
    CG,
    AB,
    BC,
    CA,
    ABG,
    BCG,
    CAG,
    ABC,
}

impl FromStr for FaultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AG" => Ok(FaultType::AG),
            "BG" => Ok(FaultType::BG),
            "CG" => Ok(FaultType::CG),
            "AB" => Ok(FaultType::AB),
            "BC" => Ok(FaultType::BC),
            "CA" => Ok(FaultType::CA),
            "ABG" => Ok(FaultType::ABG),
            "BCG" => Ok(FaultType::BCG),
            "CAG" => Ok(FaultType::CAG),
            "ABC" | "3PH" => Ok(FaultType::ABC),
            other => Err(format!("unknown fault type: {}", other)),
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FaultType::AG => "AG",
            FaultType::BG => "BG",
            FaultType::CG => "CG",
            FaultType::AB => "AB",
            FaultType::BC => "BC",
            FaultType::CA => "CA",
            FaultType::ABG => "ABG",
            FaultType::BCG => "BCG",
            FaultType::CAG => "CAG",
            FaultType::ABC => "ABC",
        };
        write!(f, "{}", s)
    }
}

/// Fault impedance `Zf = R + jX` in ohms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FaultImpedance {
    pub r: f64,
    pub x: f64,
}

/// Source model: positive/negative sequence impedance (equal), zero-sequence
/// impedance, and the pre-fault phase voltage magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceImpedance {
    pub rs1: f64,
    pub xs1: f64,
    pub rs0: f64,
    pub xs0: f64,
    pub v_prefault: f64,
}

/// Three phase quantities as complex phasors.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThreePhase {
    pub a: Complex64,
    pub b: Complex64,
    pub c: Complex64,
}

/// Voltages and currents at the relay location for one fault.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhasorState {
    pub voltage: ThreePhase,
    pub current: ThreePhase,
}

/// The rotation operator `a = e^(j 120 deg)`.
fn alpha() -> Complex64 {
    Complex64::from_polar(1.0, 120f64.to_radians())
}

fn alpha2() -> Complex64 {
    Complex64::from_polar(1.0, (-120f64).to_radians())
}

/// Transforms phase quantities to `(zero, positive, negative)` sequence
/// quantities.
pub fn abc_to_sequence(abc: &ThreePhase) -> ThreePhase {
    ThreePhase {
        a: (abc.a + abc.b + abc.c) / 3.0,
        b: (abc.a + alpha() * abc.b + alpha2() * abc.c) / 3.0,
        c: (abc.a + alpha2() * abc.b + alpha() * abc.c) / 3.0,
    }
}

/// Transforms `(zero, positive, negative)` sequence quantities to phase
/// quantities.
pub fn sequence_to_abc(seq: &ThreePhase) -> ThreePhase {
    ThreePhase {
        a: seq.a + seq.b + seq.c,
        b: seq.a + alpha2() * seq.b + alpha() * seq.c,
        c: seq.a + alpha() * seq.b + alpha2() * seq.c,
    }
}

/// Cyclic rotation A->B->C (the reference solution shifted forward one
/// phase).
fn rotate_forward(p: &ThreePhase) -> ThreePhase {
    ThreePhase {
        a: p.c,
        b: p.a,
        c: p.b,
    }
}

/// Cyclic rotation A->C->B.
fn rotate_backward(p: &ThreePhase) -> ThreePhase {
    ThreePhase {
        a: p.b,
        b: p.c,
        c: p.a,
    }
}

fn rotate_state(state: PhasorState, rotate: fn(&ThreePhase) -> ThreePhase) -> PhasorState {
    PhasorState {
        voltage: rotate(&state.voltage),
        current: rotate(&state.current),
    }
}

/// Solves the requested fault.
pub fn calculate_fault(
    fault_type: FaultType,
    fault_z: &FaultImpedance,
    source: &SourceImpedance,
) -> PhasorState {
    match fault_type {
        FaultType::AG => single_line_ground(fault_z, source),
        FaultType::BG => rotate_state(single_line_ground(fault_z, source), rotate_forward),
        FaultType::CG => rotate_state(single_line_ground(fault_z, source), rotate_backward),
        FaultType::BC => line_to_line(fault_z, source),
        FaultType::AB => rotate_state(line_to_line(fault_z, source), rotate_forward),
        FaultType::CA => rotate_state(line_to_line(fault_z, source), rotate_backward),
        FaultType::BCG => double_line_ground(fault_z, source),
        FaultType::ABG => rotate_state(double_line_ground(fault_z, source), rotate_forward),
        FaultType::CAG => rotate_state(double_line_ground(fault_z, source), rotate_backward),
        FaultType::ABC => three_phase(fault_z, source),
    }
}

fn impedances(
    fault_z: &FaultImpedance,
    source: &SourceImpedance,
) -> (Complex64, Complex64, Complex64, Complex64) {
    let zs1 = Complex64::new(source.rs1, source.xs1);
    let zs0 = Complex64::new(source.rs0, source.xs0);
    let zf = Complex64::new(fault_z.r, fault_z.x);
    let v_prefault = Complex64::new(source.v_prefault, 0.0);
    (zs1, zs0, zf, v_prefault)
}

/// A-G fault: `I1 = I2 = I0 = V / (Zs1 + Zs2 + Zs0 + 3 Zf)`.
fn single_line_ground(fault_z: &FaultImpedance, source: &SourceImpedance) -> PhasorState {
    let (zs1, zs0, zf, v_prefault) = impedances(fault_z, source);
    let zs2 = zs1;

    let i1 = v_prefault / (zs1 + zs2 + zs0 + 3.0 * zf);

    let i_seq = ThreePhase {
        a: i1,
        b: i1,
        c: i1,
    };
    let v_seq = ThreePhase {
        a: -zs0 * i1,
        b: v_prefault - zs1 * i1,
        c: -zs2 * i1,
    };

    PhasorState {
        voltage: sequence_to_abc(&v_seq),
        current: sequence_to_abc(&i_seq),
    }
}

/// B-C fault: `I0 = 0`, `I1 = -I2 = V / (Zs1 + Zs2 + Zf)`.
fn line_to_line(fault_z: &FaultImpedance, source: &SourceImpedance) -> PhasorState {
    let (zs1, _zs0, zf, v_prefault) = impedances(fault_z, source);
    let zs2 = zs1;

    let i1 = v_prefault / (zs1 + zs2 + zf);

    let i_seq = ThreePhase {
        a: Complex64::default(),
        b: i1,
        c: -i1,
    };
    let v_seq = ThreePhase {
        a: Complex64::default(),
        b: v_prefault - zs1 * i1,
        c: zs2 * i1,
    };

    PhasorState {
        voltage: sequence_to_abc(&v_seq),
        current: sequence_to_abc(&i_seq),
    }
}

/// B-C-G fault: negative and grounded-zero branches in parallel behind the
/// positive network.
fn double_line_ground(fault_z: &FaultImpedance, source: &SourceImpedance) -> PhasorState {
    let (zs1, zs0, zf, v_prefault) = impedances(fault_z, source);
    let zs2 = zs1;

    let z0_branch = zs0 + 3.0 * zf;
    let z_parallel = (zs2 * z0_branch) / (zs2 + z0_branch);

    let i1 = v_prefault / (zs1 + z_parallel);
    let v1 = v_prefault - zs1 * i1;
    let i2 = -v1 / zs2;
    let i0 = -v1 / z0_branch;

    let i_seq = ThreePhase {
        a: i0,
        b: i1,
        c: i2,
    };
    let v_seq = ThreePhase {
        a: -zs0 * i0,
        b: v1,
        c: -zs2 * i2,
    };

    PhasorState {
        voltage: sequence_to_abc(&v_seq),
        current: sequence_to_abc(&i_seq),
    }
}

/// Balanced fault: only the positive network carries current.
fn three_phase(fault_z: &FaultImpedance, source: &SourceImpedance) -> PhasorState {
    let (zs1, _zs0, zf, v_prefault) = impedances(fault_z, source);

    let i1 = v_prefault / (zs1 + zf);

    let i_seq = ThreePhase {
        a: Complex64::default(),
        b: i1,
        c: Complex64::default(),
    };
    let v_seq = ThreePhase {
        a: Complex64::default(),
        b: v_prefault - zs1 * i1,
        c: Complex64::default(),
    };

    PhasorState {
        voltage: sequence_to_abc(&v_seq),
        current: sequence_to_abc(&i_seq),
    }
}

/// Healthy-system state: nominal positive-sequence voltages, zero current.
/// Used as the pre-fault condition by the distance driver.
pub fn prefault_state(source: &SourceImpedance) -> PhasorState {
    let v = Complex64::new(source.v_prefault, 0.0);
    PhasorState {
        voltage: ThreePhase {
            a: v,
            b: v * alpha2(),
            c: v * alpha(),
        },
        current: ThreePhase::default(),
    }
}
