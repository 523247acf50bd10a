use geocluster::{Aggregation, Entry, GeoclusterError, MutableGeocluster};

#[derive(Clone, Debug, PartialEq)]
struct Station {
    lon: f64,
    lat: f64,
    capacity: i64,
}

impl geocluster::ClusterPoint for Station {
    fn x(&self) -> f64 {
        self.lon
    }

    fn y(&self) -> f64 {
        self.lat
    }
}

#[derive(Clone, Debug)]
struct Capacity {
    total: i64,
}

fn main() -> Result<(), GeoclusterError> {
    env_logger::init();

    let options = MutableGeocluster::<Station, Capacity>::builder()
        .radius(40.0)
        .min_points(2)
        .build();

    let aggregation: Aggregation<Station, Capacity, ()> = Aggregation::map_reduce(
        |station: &Station| Capacity {
            total: station.capacity,
        },
        |acc, other| acc.total += other.total,
    );

    let mut index = MutableGeocluster::with_aggregation(options, aggregation)?;

    index.load(vec![
        Station { lon: 4.35, lat: 50.85, capacity: 8 },
        Station { lon: 4.36, lat: 50.84, capacity: 4 },
        Station { lon: 4.90, lat: 52.37, capacity: 12 },
    ])?;

    index.add(Station { lon: 4.34, lat: 50.86, capacity: 6 })?;
    index.remove(&Station { lon: 4.90, lat: 52.37, capacity: 12 })?;

    for entry in index.search([0.0, 45.0, 10.0, 55.0], 6)? {
        match entry {
            Entry::Cluster(cluster) => {
                let capacity = cluster.aggregate.map_or(0, |c| c.total);
                println!(
                    "cluster of {} stations, {} total capacity",
                    cluster.num_points, capacity
                );
            }
            Entry::Leaf(leaf) => {
                println!("station with capacity {}", leaf.point.capacity);
            }
        }
    }

    Ok(())
}
