//! Point-cloud files: whitespace-separated `x y z` records.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::point::Point;

fn reader<R: Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(source)
}

pub fn read_xyz<P: AsRef<Path>>(path: P) -> Result<Vec<Point>> {
    let file = File::open(path.as_ref())?;
    let points = parse_xyz(BufReader::new(file))?;
    debug!(path = %path.as_ref().display(), points = points.len(), "read point cloud");
    Ok(points)
}

/// Records of 3 or 6 fields start with `x y z`; records of 8 fields carry
/// them in fields 3 to 5. Records of any other width are skipped.
pub fn parse_xyz<R: Read>(source: R) -> Result<Vec<Point>> {
    let mut points = Vec::new();

    for record in reader(source).records() {
        let record = record?;
        let line = record.position().map(|p| p.line() as usize).unwrap_or(0);
        let fields = record
            .iter()
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>();

        let xyz = match fields.len() {
            3 | 6 => &fields[0..3],
            8 => &fields[2..5],
            _ => continue,
        };

        let mut coordinates = [0f32; 3];
        for (value, field) in coordinates.iter_mut().zip(xyz) {
            *value = field.parse().map_err(|e| Error::Parse {
                line,
                message: format!("invalid number `{}`: {}", field, e),
            })?;
        }
        points.push(Point::new(coordinates[0], coordinates[1], coordinates[2]));
    }

    Ok(points)
}

pub fn write_xyz<P: AsRef<Path>>(path: P, points: &[Point]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_path(path.as_ref())?;
    for point in points {
        writer.serialize((point.x, point.y, point.z))?;
    }
    writer.flush()?;
    debug!(path = %path.as_ref().display(), points = points.len(), "wrote grid");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn record_widths() {
        let text = "\
1 2 3
4  5 6 0 0 0
9 9 7.5 8 9.25 9 9 9
1 2
1 2 3 4
";
        let points = parse_xyz(text.as_bytes()).unwrap();
        assert_eq!(
            points,
            vec![
                Point::new(1.0, 2.0, 3.0),
                Point::new(4.0, 5.0, 6.0),
                Point::new(7.5, 8.0, 9.25),
            ]
        );
    }

    #[test]
    fn tabs_and_blank_lines() {
        let points = parse_xyz("0.5\t1.5\t2.5\n\n-1 -2 -3\n".as_bytes()).unwrap();
        assert_eq!(
            points,
            vec![Point::new(0.5, 1.5, 2.5), Point::new(-1.0, -2.0, -3.0)]
        );
    }

    #[test]
    fn malformed_number_reports_its_line() {
        let Err(Error::Parse { line, message }) = parse_xyz("1 2 3\n4 five 6\n".as_bytes())
        else {
            panic!("expected a parse error");
        };
        assert_eq!(line, 2);
        assert!(message.contains("five"));
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.xyz");
        let grid = vec![Point::new(0.0, 0.0, 1.25), Point::new(0.5, 0.0, -3.0)];
        write_xyz(&path, &grid).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("0.0 0.0 1.25"));
        assert_eq!(read_xyz(&path).unwrap(), grid);
    }

    #[test]
    fn read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        writeln!(file, "1 1 1").unwrap();
        assert_eq!(read_xyz(file.path()).unwrap().len(), 1);
        assert!(matches!(
            read_xyz(dir.path().join("absent.xyz")),
            Err(Error::Io(_))
        ));
    }
}
