use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use crate::error::{Error, Result};
use crate::math::DBLEPS;




/**
 * The restart record of one obstacle: time, position, absolute displacement,
 * orientation quaternion, translational and angular velocity, and the planar
 * heading angle. Written as text, one tab-separated group per line, with
 * enough digits to reproduce every value exactly.
 */
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BodyRecord {
    pub time: f64,
    pub position: [f64; 3],
    pub abs_position: [f64; 3],
    pub quaternion: [f64; 4],
    pub trans_vel: [f64; 3],
    pub ang_vel: [f64; 3],
    pub angle_2d: f64,
}

const NUM_VALUES: usize = 1 + 3 + 3 + 4 + 3 + 3 + 1;




// ============================================================================
impl BodyRecord {


    pub fn to_text(&self) -> String {
        let groups: [&[f64]; 7] = [
            &[self.time],
            &self.position,
            &self.abs_position,
            &self.quaternion,
            &self.trans_vel,
            &self.ang_vel,
            &[self.angle_2d],
        ];
        let mut text = String::new();

        for group in groups {
            let line: Vec<_> = group.iter().map(|x| format!("{:.16e}", x)).collect();
            let _ = writeln!(text, "{}", line.join("\t"));
        }
        text
    }


    /**
     * Parse a record; the error names what is wrong with the text.
     */
    pub fn from_text(text: &str) -> std::result::Result<Self, String> {
        let values = text
            .split_whitespace()
            .map(|token| token.parse::<f64>().map_err(|e| format!("'{}': {}", token, e)))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if values.len() != NUM_VALUES {
            return Err(format!("expected {} values, found {}", NUM_VALUES, values.len()));
        }
        if let Some(x) = values.iter().find(|x| !x.is_finite()) {
            return Err(format!("non-finite value {}", x));
        }
        let a3 = |i: usize| [values[i], values[i + 1], values[i + 2]];
        let quaternion = [values[7], values[8], values[9], values[10]];
        let norm = quaternion.iter().map(|x| x * x).sum::<f64>().sqrt();

        if (norm - 1.0).abs() > 5.0 * DBLEPS {
            return Err(format!("quaternion {:?} has norm {:e}, not one", quaternion, norm));
        }

        Ok(Self {
            time: values[0],
            position: a3(1),
            abs_position: a3(4),
            quaternion,
            trans_vel: a3(11),
            ang_vel: a3(14),
            angle_2d: values[17],
        })
    }


    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_text())?;
        Ok(())
    }


    /**
     * Read a record from a file. A missing file yields `Ok(None)`; a file
     * that exists but does not hold a valid record is an error.
     */
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::RestartCorrupt { path: path.to_path_buf(), reason: e.to_string() }),
        };
        Self::from_text(&text)
            .map(Some)
            .map_err(|reason| Error::RestartCorrupt { path: path.to_path_buf(), reason })
    }
}
