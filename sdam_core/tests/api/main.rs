mod cancellation;
mod helpers;
mod round_trip_time;
