//! Checkpoint and restart of the aggregate state as JSON.

use crate::error::Result;
use crate::polycrystal::Polycrystal;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Write the aggregate state.
pub fn save<W: Write>(poly: &Polycrystal, writer: W) -> Result<()> {
    serde_json::to_writer(writer, poly)?;
    Ok(())
}

/// Read an aggregate state and check its invariants.
pub fn load<R: Read>(reader: R) -> Result<Polycrystal> {
    let poly: Polycrystal = serde_json::from_reader(reader)?;
    poly.validate()?;
    Ok(poly)
}

pub fn save_to_path(poly: &Polycrystal, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    save(poly, &mut writer)?;
    writer.flush()?;
    Ok(())
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Polycrystal> {
    load(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crystal::CrystalSystem;
    use crate::error::Error;
    use crate::hardening::{HardeningLaw, VoceLaw, VoceParams};
    use crate::polycrystal::{Medium, Phase};
    use crate::texture::random_orientations;
    use crate::types::{DevMatrix, DevVector};
    use std::sync::Arc;

    fn aggregate() -> Polycrystal {
        let fcc = Arc::new(CrystalSystem::fcc(1.0, 0.05).unwrap());
        let phase = Phase::from_orientations(
            "fcc",
            fcc,
            1.0,
            &random_orientations(5, 12),
            HardeningLaw::Voce(VoceLaw::uniform(1, VoceParams::default())),
        )
        .unwrap();
        let mut poly = Polycrystal::single_phase(phase).unwrap();
        poly.medium = Some(Medium {
            compliance: DevMatrix::identity() * 0.25,
            back_extrapolated: DevVector::new(0.1, 0.0, -0.2, 0.0, 0.05),
        });
        poly.accumulated_strain = 0.35;
        poly.step = 7;
        poly
    }

    #[test]
    fn test_save_and_restore_state() {
        let poly = aggregate();
        let mut buffer = Vec::new();
        save(&poly, &mut buffer).unwrap();
        let restored = load(buffer.as_slice()).unwrap();
        assert_eq!(restored, poly);
    }

    #[test]
    fn test_restore_rejects_broken_invariants() {
        let mut poly = aggregate();
        poly.phases[0].grains[0].weight = 0.9;
        let mut buffer = Vec::new();
        save(&poly, &mut buffer).unwrap();
        assert!(matches!(load(buffer.as_slice()), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_restore_from_truncated_file() {
        let mut buffer = Vec::new();
        save(&aggregate(), &mut buffer).unwrap();
        buffer.truncate(buffer.len() / 2);
        assert!(matches!(load(buffer.as_slice()), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_path_round_trip() {
        let path = std::env::temp_dir().join(format!("vpsc-checkpoint-{}.json", std::process::id()));
        let poly = aggregate();
        save_to_path(&poly, &path).unwrap();
        let restored = load_from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(restored.step, 7);
        assert_eq!(restored.n_grains(), 5);
    }
}
