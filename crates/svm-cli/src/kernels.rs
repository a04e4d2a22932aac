//! Demo kernels available to scripts by name.
//!
//! | kernel | operands                  | args             |
//! |--------|---------------------------|------------------|
//! | fill   | 0: write                  | value, [len = 1] |
//! | copy   | 0: read, 1: write         |                  |
//! | sum    | 0: read, 1: write         |                  |
//! | fail   | any                       |                  |
//!
//! Remote replicas have no local buffer and are skipped.

use anyhow::{bail, Context};

use svm_scheduler::{ComputeOp, KernelContext};

pub const KERNELS: &[&str] = &["fill", "copy", "sum", "fail"];

pub fn build(name: &str, args: &[f32]) -> anyhow::Result<ComputeOp> {
    match name {
        "fill" => {
            let value = *args.first().context("fill needs a value argument")?;
            let len = match args.get(1) {
                Some(len) if *len < 0.0 || len.fract() != 0.0 => {
                    bail!("fill length must be a non-negative integer, got {len}")
                }
                Some(len) => *len as usize,
                None => 1,
            };
            Ok(fill(value, len))
        }
        "copy" => Ok(ComputeOp::new("copy", copy)),
        "sum" => Ok(ComputeOp::new("sum", sum)),
        "fail" => Ok(ComputeOp::new("fail", |_| bail!("failure requested by script"))),
        other => bail!("unknown kernel {other:?}, expected one of {}", KERNELS.join(", ")),
    }
}

fn local_replicas(ctx: &KernelContext<'_>, index: usize) -> anyhow::Result<Vec<u32>> {
    Ok(ctx
        .operand(index)?
        .slots()
        .iter()
        .filter(|slot| !slot.is_remote())
        .map(|slot| slot.parallel_id())
        .collect())
}

fn fill(value: f32, len: usize) -> ComputeOp {
    ComputeOp::new("fill", move |ctx| {
        for p in local_replicas(ctx, 0)? {
            ctx.write(0, p, |buf| {
                buf.clear();
                buf.resize(len, value);
            })?;
        }
        Ok(())
    })
}

/// Replica-wise copy from operand 0 into operand 1.
fn copy(ctx: &mut KernelContext<'_>) -> anyhow::Result<()> {
    for p in local_replicas(ctx, 1)? {
        let data = ctx.read(0, p)?;
        ctx.write(1, p, |buf| *buf = data)?;
    }
    Ok(())
}

/// Reduce every local replica of operand 0 and write the total into each
/// local replica of operand 1.
fn sum(ctx: &mut KernelContext<'_>) -> anyhow::Result<()> {
    let mut total = 0.0f32;
    for p in local_replicas(ctx, 0)? {
        total += ctx.read(0, p)?.iter().sum::<f32>();
    }
    for p in local_replicas(ctx, 1)? {
        ctx.write(1, p, |buf| *buf = vec![total])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kernels_build() {
        for name in ["copy", "sum", "fail"] {
            assert_eq!(build(name, &[]).unwrap().name(), name);
        }
        assert_eq!(build("fill", &[1.0, 4.0]).unwrap().name(), "fill");
    }

    #[test]
    fn fill_requires_a_value() {
        let err = build("fill", &[]).unwrap_err();
        assert!(err.to_string().contains("value"));
    }

    #[test]
    fn fill_rejects_fractional_length() {
        assert!(build("fill", &[1.0, 2.5]).is_err());
        assert!(build("fill", &[1.0, -1.0]).is_err());
    }

    #[test]
    fn unknown_kernel_lists_choices() {
        let err = build("matmul", &[]).unwrap_err();
        assert!(err.to_string().contains("fill, copy, sum, fail"));
    }
}
