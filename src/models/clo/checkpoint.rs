//! Line-oriented text checkpoints.
//!
//! Layout: one `{:04}` directory per dyad holding `states.txt` (row per
//! time step, per-member positions then velocities), `clo_params.txt`
//! (free-parameter flags line, then one row per interval), and
//! `obs_coefs.txt` (per observable: name and noise sigma, then one
//! coefficient row per member); the population directory adds
//! `shared_params.txt` with labeled sections for coefficients, variances,
//! weights, assignments, noise sigmas, and GP scales.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use num_traits::ToPrimitive;
use thiserror::Error;

use super::population::LssSet;
use super::state_space::LinearStateSpace;

/// Errors raised while reading or writing checkpoint files.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("can't access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed {what} in {path}")]
    Parse { what: &'static str, path: PathBuf },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), CheckpointError> {
    fs::write(path, contents).map_err(io_error(path))
}

fn read_file(path: &Path) -> Result<String, CheckpointError> {
    fs::read_to_string(path).map_err(io_error(path))
}

fn parse_row(line: &str, what: &'static str, path: &Path) -> Result<Vec<f64>, CheckpointError> {
    line.split_whitespace()
        .map(|token| {
            token.parse::<f64>().map_err(|_| CheckpointError::Parse {
                what,
                path: path.to_path_buf(),
            })
        })
        .collect()
}

fn format_row(values: &[f64]) -> String {
    let mut line = String::new();
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            line.push(' ');
        }
        let _ = write!(line, "{value:.12e}");
    }
    line
}

/// Directory name of one dyad inside a population checkpoint.
#[must_use]
pub fn dyad_dir(parent: &Path, id: u64) -> PathBuf {
    parent.join(format!("{id:04}"))
}

/// Write one dyad model. The predicted-state cache is refreshed on a
/// clone, so the input does not need to be current.
///
/// # Errors
///
/// Returns `CheckpointError` on I/O failure.
pub fn write_lss(dir: &Path, lss: &LinearStateSpace) -> Result<(), CheckpointError> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;
    let mut current = lss.clone();
    current.refresh();

    let members = current.num_oscillators();
    let mut states = String::new();
    for state in current.states() {
        // Positions first, then velocities; states are stored that way.
        let _ = writeln!(states, "{}", format_row(state));
        debug_assert_eq!(state.len(), 2 * members);
    }
    write_file(&dir.join("states.txt"), &states)?;

    let mut params = String::new();
    let flags = vec![1.0; current.oscillators()[0].num_params()];
    let _ = writeln!(params, "{}", format_row(&flags));
    for oscillator in current.oscillators() {
        let _ = writeln!(params, "{}", format_row(oscillator.params()));
    }
    write_file(&dir.join("clo_params.txt"), &params)?;

    let mut obs = String::new();
    for (observable, name) in current.obs_names().iter().enumerate() {
        let _ = writeln!(obs, "{name} {:.12e}", current.noise_sigmas()[observable]);
        for member in 0..members {
            let _ = writeln!(obs, "{}", format_row(&current.obs_coefs()[observable][member]));
        }
    }
    write_file(&dir.join("obs_coefs.txt"), &obs)?;

    if !current.poly_coefs().is_empty() {
        let mut poly = String::new();
        for coefs in current.poly_coefs() {
            let _ = writeln!(poly, "{}", format_row(coefs));
        }
        write_file(&dir.join("poly_coefs.txt"), &poly)?;
    }
    Ok(())
}

/// Read one dyad model back into an existing structure (shapes must
/// match; values are replaced).
///
/// # Errors
///
/// Returns `CheckpointError` on I/O failure or malformed content.
pub fn read_lss(dir: &Path, lss: &mut LinearStateSpace) -> Result<(), CheckpointError> {
    let states_path = dir.join("states.txt");
    let states_text = read_file(&states_path)?;
    let first_row = states_text
        .lines()
        .next()
        .ok_or(CheckpointError::Parse {
            what: "states",
            path: states_path.clone(),
        })?;
    let init_state = parse_row(first_row, "states", &states_path)?;
    if init_state.len() != lss.init_state().len() {
        return Err(CheckpointError::Parse {
            what: "states",
            path: states_path,
        });
    }
    for (index, value) in init_state.iter().enumerate() {
        lss.set_init_state_coord(index, *value);
    }

    let params_path = dir.join("clo_params.txt");
    let params_text = read_file(&params_path)?;
    let mut lines = params_text.lines();
    let _flags = lines.next().ok_or(CheckpointError::Parse {
        what: "clo params",
        path: params_path.clone(),
    })?;
    for (interval, line) in lines.enumerate() {
        let row = parse_row(line, "clo params", &params_path)?;
        if row.len() != lss.oscillators()[0].num_params() {
            return Err(CheckpointError::Parse {
                what: "clo params",
                path: params_path,
            });
        }
        for (index, value) in row.iter().enumerate() {
            lss.set_clo_param(interval, index, *value);
        }
        if !lss.allow_drift() {
            break;
        }
    }

    let obs_path = dir.join("obs_coefs.txt");
    let obs_text = read_file(&obs_path)?;
    let members = lss.num_oscillators();
    let mut sigmas = lss.noise_sigmas().to_vec();
    let mut lines = obs_text.lines();
    for observable in 0..lss.obs_names().len() {
        let header = lines.next().ok_or(CheckpointError::Parse {
            what: "observable header",
            path: obs_path.clone(),
        })?;
        let sigma_token = header.split_whitespace().nth(1).ok_or(CheckpointError::Parse {
            what: "observable header",
            path: obs_path.clone(),
        })?;
        sigmas[observable] =
            sigma_token
                .parse::<f64>()
                .map_err(|_| CheckpointError::Parse {
                    what: "noise sigma",
                    path: obs_path.clone(),
                })?;
        for member in 0..members {
            let line = lines.next().ok_or(CheckpointError::Parse {
                what: "observation coefficients",
                path: obs_path.clone(),
            })?;
            let coef = parse_row(line, "observation coefficients", &obs_path)?;
            lss.set_obs_coef(observable, member, coef);
        }
    }
    lss.set_noise_sigmas(sigmas);

    let poly_path = dir.join("poly_coefs.txt");
    if poly_path.is_file() && !lss.poly_coefs().is_empty() {
        let poly_text = read_file(&poly_path)?;
        for (member, line) in poly_text.lines().enumerate().take(members) {
            let row = parse_row(line, "polynomial coefficients", &poly_path)?;
            for (power, value) in row.iter().enumerate() {
                lss.set_poly_coef(member, power, *value);
            }
        }
    }

    lss.refresh();
    Ok(())
}

/// Write the whole population: shared parameters plus one directory per
/// dyad.
///
/// # Errors
///
/// Returns `CheckpointError` on I/O failure.
pub fn write_population(dir: &Path, set: &LssSet) -> Result<(), CheckpointError> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let mut shared = String::new();
    let _ = writeln!(shared, "groups {}", set.num_groups());
    for (index, group) in set.group_params().iter().enumerate() {
        let _ = writeln!(shared, "group {index}");
        let _ = writeln!(shared, "weight {:.12e}", group.weight);
        let _ = writeln!(shared, "coefs");
        for coefs in &group.pred_coefs {
            let _ = writeln!(shared, "{}", format_row(coefs));
        }
        let _ = writeln!(shared, "variances");
        let _ = writeln!(shared, "{}", format_row(&group.variances));
    }
    let _ = writeln!(shared, "assignments");
    let assignment_row: Vec<f64> = set
        .assignments()
        .iter()
        .map(|group| crate::utils::usize_to_f64(*group))
        .collect();
    let _ = writeln!(shared, "{}", format_row(&assignment_row));
    let _ = writeln!(shared, "noise_sigmas");
    let _ = writeln!(shared, "{}", format_row(set.noise_sigmas()));
    let _ = writeln!(shared, "gp_scales");
    let _ = writeln!(shared, "{}", format_row(set.gp_scales()));
    let _ = writeln!(shared, "gp_sigvars");
    let _ = writeln!(shared, "{}", format_row(set.gp_sigvars()));
    write_file(&dir.join("shared_params.txt"), &shared)?;

    for (id, lss) in set.ids().iter().zip(set.lss_vec()) {
        write_lss(&dyad_dir(dir, *id), lss)?;
    }
    Ok(())
}

/// Read a population checkpoint back into an existing set (structure must
/// match; values are replaced).
///
/// # Errors
///
/// Returns `CheckpointError` on I/O failure or malformed content.
pub fn read_population(dir: &Path, set: &mut LssSet) -> Result<(), CheckpointError> {
    let shared_path = dir.join("shared_params.txt");
    let text = read_file(&shared_path)?;
    let mut lines = text.lines();

    let parse_err = |what: &'static str| CheckpointError::Parse {
        what,
        path: shared_path.clone(),
    };

    let header = lines.next().ok_or_else(|| parse_err("groups header"))?;
    let group_count: usize = header
        .split_whitespace()
        .nth(1)
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| parse_err("groups header"))?;
    if group_count != set.num_groups() {
        return Err(parse_err("group count"));
    }

    for group_index in 0..group_count {
        let _ = lines.next().ok_or_else(|| parse_err("group header"))?;
        let weight_line = lines.next().ok_or_else(|| parse_err("group weight"))?;
        let weight: f64 = weight_line
            .split_whitespace()
            .nth(1)
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| parse_err("group weight"))?;
        let _ = lines.next().ok_or_else(|| parse_err("coefs header"))?;
        let num_params = set.group_params()[group_index].pred_coefs.len();
        let mut coefs = Vec::with_capacity(num_params);
        for _ in 0..num_params {
            let line = lines.next().ok_or_else(|| parse_err("coefs"))?;
            coefs.push(parse_row(line, "coefs", &shared_path)?);
        }
        let _ = lines.next().ok_or_else(|| parse_err("variances header"))?;
        let variance_line = lines.next().ok_or_else(|| parse_err("variances"))?;
        let variances = parse_row(variance_line, "variances", &shared_path)?;
        if variances.len() != num_params {
            return Err(parse_err("variances"));
        }
        let group = &mut set.group_params_mut()[group_index];
        group.weight = weight;
        group.pred_coefs = coefs;
        group.variances = variances;
    }

    let _ = lines.next().ok_or_else(|| parse_err("assignments header"))?;
    let assignment_line = lines.next().ok_or_else(|| parse_err("assignments"))?;
    let assignments = parse_row(assignment_line, "assignments", &shared_path)?;
    if assignments.len() != set.num_dyads() {
        return Err(parse_err("assignments"));
    }
    for (dyad, group) in assignments.iter().enumerate() {
        let group = group
            .to_usize()
            .filter(|index| *index < set.num_groups())
            .ok_or_else(|| parse_err("assignments"))?;
        set.assign_to_group(dyad, group);
    }

    let _ = lines.next().ok_or_else(|| parse_err("noise header"))?;
    let noise_line = lines.next().ok_or_else(|| parse_err("noise sigmas"))?;
    let sigmas = parse_row(noise_line, "noise sigmas", &shared_path)?;
    if sigmas.len() != set.noise_sigmas().len() {
        return Err(parse_err("noise sigmas"));
    }
    set.set_noise_sigmas(&sigmas);

    let _ = lines.next().ok_or_else(|| parse_err("gp scales header"))?;
    let scales_line = lines.next().unwrap_or_default();
    let scales = parse_row(scales_line, "gp scales", &shared_path)?;
    for (index, value) in scales.iter().enumerate().take(set.gp_scales().len()) {
        set.set_gp_scale(index, *value);
    }
    let _ = lines.next();
    let sigvars_line = lines.next().unwrap_or_default();
    let sigvars = parse_row(sigvars_line, "gp sigvars", &shared_path)?;
    for (index, value) in sigvars.iter().enumerate().take(set.gp_sigvars().len()) {
        set.set_gp_sigvar(index, *value);
    }

    let ids: Vec<u64> = set.ids().to_vec();
    for (index, id) in ids.iter().enumerate() {
        let sub_dir = dyad_dir(dir, *id);
        read_lss(&sub_dir, &mut set.lss_vec_mut()[index])?;
    }
    set.update_means();
    set.update_variances();
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::models::clo::oscillator::CoupledOscillator;
    use crate::models::clo::population::GroupParams;

    use super::*;

    fn build_set() -> LssSet {
        let times: Vec<f64> = (0..8).map(|t| f64::from(t) * 0.5).collect();
        let lss_vec: Vec<LinearStateSpace> = (0..2)
            .map(|dyad| {
                let mut lss = LinearStateSpace::new(
                    times.clone(),
                    vec![0.4 + f64::from(dyad), -0.4, 0.1, 0.0],
                    vec![CoupledOscillator::new(2, 4.0 + f64::from(dyad), 0.05)],
                    vec!["dial".to_owned()],
                    vec![0.5],
                    None,
                    false,
                    0,
                );
                lss.set_predictors(vec![vec![1.0]; 8]);
                lss.refresh();
                lss
            })
            .collect();
        let mut group = GroupParams::new(8, 1, 1.0, 1.0);
        group.pred_coefs[0][0] = 1.23;
        group.variances[3] = 0.37;
        LssSet::new(
            vec![7, 12],
            lss_vec,
            vec![group],
            vec![0.5],
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn population_round_trip_preserves_parameters() {
        let set = build_set();
        let dir = std::env::temp_dir().join("clo_checkpoint_roundtrip");
        let _ = fs::remove_dir_all(&dir);
        write_population(&dir, &set).expect("write succeeds");

        let mut restored = build_set();
        // Scramble the restored copy first so equality is meaningful.
        restored.group_params_mut()[0].pred_coefs[0][0] = 0.0;
        restored.set_noise_sigmas(&[2.0]);
        restored.lss_vec_mut()[0].set_clo_param(0, 2, 9.9);
        read_population(&dir, &mut restored).expect("read succeeds");

        assert_relative_eq!(restored.group_params()[0].pred_coefs[0][0], 1.23);
        assert_relative_eq!(restored.group_params()[0].variances[3], 0.37);
        assert_relative_eq!(restored.noise_sigmas()[0], 0.5);
        for (a, b) in set.lss_vec().iter().zip(restored.lss_vec()) {
            for index in 0..8 {
                assert_relative_eq!(
                    a.oscillators()[0].param(index),
                    b.oscillators()[0].param(index),
                    epsilon = 1.0e-10
                );
            }
            for index in 0..4 {
                assert_relative_eq!(a.init_state()[index], b.init_state()[index], epsilon = 1.0e-10);
            }
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_reports_malformed_states() {
        let dir = std::env::temp_dir().join("clo_checkpoint_malformed");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("temp dir");
        fs::write(dir.join("states.txt"), "not numbers\n").expect("write");
        let mut lss = build_set().lss_vec()[0].clone();
        let error = read_lss(&dir, &mut lss).expect_err("malformed file should fail");
        assert!(matches!(error, CheckpointError::Parse { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = std::env::temp_dir().join("clo_checkpoint_missing_nonexistent");
        let mut set = build_set();
        let error = read_population(&dir, &mut set).expect_err("missing dir should fail");
        assert!(matches!(error, CheckpointError::Io { .. }));
    }
}
