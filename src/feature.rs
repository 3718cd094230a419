//! Records as they arrive from the wire, before any field mapping.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Open attribute mapping of a raw record, in the order the service sent it.
pub type Attributes = Map<String, Value>;

/// One untransformed feature from an ArcGIS `query` reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub geometry: Option<Value>,
}

impl RawFeature {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            geometry: None,
        }
    }

    /// Object id under the layer's id field, falling back to the usual spellings.
    pub fn object_id(&self, id_field: &str) -> Option<i64> {
        object_id_of(&self.attributes, id_field)
    }
}

pub fn object_id_of(attrs: &Attributes, id_field: &str) -> Option<i64> {
    ["OBJECTID", "ObjectId", id_field]
        .iter()
        .filter_map(|k| attrs.get(*k))
        .find_map(as_i64)
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// WGS84 coordinate: `x` is longitude, `y` is latitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    MultiPoint(Vec<Coord>),
    Polyline(Vec<Vec<Coord>>),
    /// Rings; the first ring of each part is its outer boundary.
    Polygon(Vec<Vec<Coord>>),
}

impl Geometry {
    /// Parses Esri JSON geometry (`{x,y}`, `{points}`, `{paths}`, `{rings}`).
    pub fn from_esri(value: &Value) -> Option<Geometry> {
        let obj = value.as_object()?;
        if let (Some(x), Some(y)) = (obj.get("x"), obj.get("y")) {
            return Some(Geometry::Point(coord(x.as_f64()?, y.as_f64()?)?));
        }
        if let Some(points) = obj.get("points") {
            return non_empty(coords(points)?).map(Geometry::MultiPoint);
        }
        if let Some(paths) = obj.get("paths") {
            return non_empty(lines(paths)?).map(Geometry::Polyline);
        }
        if let Some(rings) = obj.get("rings") {
            return non_empty(lines(rings)?).map(Geometry::Polygon);
        }
        None
    }

    /// Parses a GeoJSON geometry object.
    pub fn from_geojson(value: &Value) -> Option<Geometry> {
        let obj = value.as_object()?;
        let c = obj.get("coordinates")?;
        match obj.get("type")?.as_str()? {
            "Point" => position(c).map(Geometry::Point),
            "MultiPoint" => non_empty(coords(c)?).map(Geometry::MultiPoint),
            "LineString" => non_empty(coords(c)?).map(|l| Geometry::Polyline(vec![l])),
            "MultiLineString" => non_empty(lines(c)?).map(Geometry::Polyline),
            "Polygon" => non_empty(lines(c)?).map(Geometry::Polygon),
            // Only the first polygon's outer ring is used for the representative point.
            "MultiPolygon" => {
                let first = c.as_array()?.first()?;
                non_empty(lines(first)?).map(Geometry::Polygon)
            }
            _ => None,
        }
    }

    /// The point itself, or the centroid of a more complex shape.
    pub fn representative_point(&self) -> Option<Coord> {
        match self {
            Geometry::Point(c) => Some(*c),
            Geometry::MultiPoint(points) => mean(points.iter()),
            Geometry::Polyline(paths) => mean(paths.iter().flatten()),
            Geometry::Polygon(rings) => {
                let outer = rings.first()?;
                ring_centroid(outer).or_else(|| mean(outer.iter()))
            }
        }
    }
}

fn coord(x: f64, y: f64) -> Option<Coord> {
    (x.is_finite() && y.is_finite()).then_some(Coord { x, y })
}

fn position(v: &Value) -> Option<Coord> {
    let arr = v.as_array()?;
    coord(arr.first()?.as_f64()?, arr.get(1)?.as_f64()?)
}

fn coords(v: &Value) -> Option<Vec<Coord>> {
    Some(v.as_array()?.iter().filter_map(position).collect())
}

fn lines(v: &Value) -> Option<Vec<Vec<Coord>>> {
    Some(
        v.as_array()?
            .iter()
            .filter_map(coords)
            .filter(|l| !l.is_empty())
            .collect(),
    )
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() { None } else { Some(v) }
}

fn mean<'a>(points: impl Iterator<Item = &'a Coord>) -> Option<Coord> {
    let (mut sx, mut sy, mut n) = (0.0, 0.0, 0usize);
    for p in points {
        sx += p.x;
        sy += p.y;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    coord(sx / n as f64, sy / n as f64)
}

// Shoelace centroid; None for degenerate (zero-area) rings.
fn ring_centroid(ring: &[Coord]) -> Option<Coord> {
    if ring.len() < 3 {
        return None;
    }
    let (mut a, mut cx, mut cy) = (0.0, 0.0, 0.0);
    for (i, p) in ring.iter().enumerate() {
        let q = ring[(i + 1) % ring.len()];
        let cross = p.x * q.y - q.x * p.y;
        a += cross;
        cx += (p.x + q.x) * cross;
        cy += (p.y + q.y) * cross;
    }
    if a.abs() < f64::EPSILON {
        return None;
    }
    a *= 0.5;
    coord(cx / (6.0 * a), cy / (6.0 * a))
}
