//! Dependence distances along band members and coincidence recomputation.

use std::collections::BTreeMap;

use polygpu_ir::aff::{AffExpr, QuasiAff};
use polygpu_ir::tree::Band;
use polygpu_ir::{Dependence, Kernel};

use crate::error::Result;

/// Distance the member travels between a dependence source and its sink,
/// `None` when it is not a known constant.
///
/// Sink iterators are identified with the source iterators of the same
/// position; the distance vector is in the source iterator order.
pub fn member_delta(kernel: &Kernel, dep: &Dependence, src: &QuasiAff, snk: &QuasiAff) -> Result<Option<i64>> {
    let source = kernel.statement(&dep.source)?;
    let sink = kernel.statement(&dep.sink)?;

    let rename: BTreeMap<&str, Option<&str>> = sink
        .domain
        .iter()
        .enumerate()
        .map(|(k, it)| (it.name.as_str(), source.domain.get(k).map(|s| s.name.as_str())))
        .collect();
    let mut renamed = AffExpr::constant(snk.aff.constant_term());
    for (name, coeff) in snk.aff.terms() {
        match rename.get(name).copied().flatten() {
            Some(src_name) => renamed = renamed + AffExpr::term(src_name, coeff),
            None => return Ok(None),
        }
    }
    let snk = QuasiAff { aff: renamed, div: snk.div, modulo: snk.modulo };

    let shift: i64 = source
        .domain
        .iter()
        .enumerate()
        .map(|(k, it)| src.aff.coeff(&it.name) * dep.distance.get(k).copied().unwrap_or(0))
        .sum();

    if *src == snk && shift == 0 {
        return Ok(Some(0));
    }
    let same_terms = src.aff.clone() - AffExpr::constant(src.aff.constant_term())
        == snk.aff.clone() - AffExpr::constant(snk.aff.constant_term());
    if src.div == 1 && snk.div == 1 && src.modulo.is_none() && snk.modulo.is_none() && same_terms {
        return Ok(Some(shift + snk.aff.constant_term() - src.aff.constant_term()));
    }
    Ok(None)
}

/// Coincidence of every member of `band`, from the non-forced dependences
/// between its statements. A dependence carried by an earlier member no
/// longer constrains the later ones.
pub fn recompute_coincidence(kernel: &Kernel, band: &Band) -> Result<Vec<bool>> {
    let stmts = band.statements();
    let mut live: Vec<&Dependence> = kernel
        .dependences
        .iter()
        .filter(|d| !d.forced && stmts.contains(d.source.as_str()) && stmts.contains(d.sink.as_str()))
        .collect();

    let mut out = Vec::with_capacity(band.n_member());
    for member in &band.members {
        let mut coincident = true;
        let mut carried = Vec::new();
        for (idx, dep) in live.iter().enumerate() {
            let (Some(src), Some(snk)) = (member.get(&dep.source), member.get(&dep.sink)) else {
                coincident = false;
                continue;
            };
            match member_delta(kernel, dep, src, snk)? {
                Some(0) => {}
                Some(d) => {
                    coincident = false;
                    if d > 0 && src.div == 1 {
                        carried.push(idx);
                    }
                }
                None => coincident = false,
            }
        }
        for idx in carried.into_iter().rev() {
            live.remove(idx);
        }
        out.push(coincident);
    }
    Ok(out)
}

/// `band` with its coincidence flags recomputed.
pub fn with_recomputed_coincidence(kernel: &Kernel, band: &Band) -> Result<Band> {
    let flags = recompute_coincidence(kernel, band)?;
    let mut band = band.clone();
    for (member, flag) in band.members.iter_mut().zip(flags) {
        member.coincident = flag;
    }
    Ok(band)
}
